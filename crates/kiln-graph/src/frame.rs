//! Per-frame state handed to passes.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kiln_core::{Extent, PixelFormat};

use crate::binding::ArgumentBufferId;
use crate::compiler::CompiledProgram;
use crate::gpu::{Gpu, GpuError};
use crate::pass::{self, BoundGroup, PassError};
use crate::resources::ResourcePool;

/// Size and format of the display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub extent: Extent,
    pub format: PixelFormat,
}

impl SurfaceInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            extent: Extent::flat(width.max(1), height.max(1)),
            format,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared graph state
// ---------------------------------------------------------------------------

/// State shared between the frame driver and async workers.
pub struct GraphContext<G: Gpu> {
    pub gpu: Arc<G>,
    pub compiled: CompiledProgram,
    programs: OnceLock<Vec<G::Program>>,
    resources: RwLock<ResourcePool<G>>,
    surface: Mutex<Option<SurfaceInfo>>,
    /// One bind group per argument buffer, shared by every leaf using it.
    argument_groups: Mutex<Vec<Option<BoundGroup<G>>>>,
}

impl<G: Gpu> GraphContext<G> {
    pub(crate) fn new(gpu: Arc<G>, compiled: CompiledProgram, resources: ResourcePool<G>) -> Self {
        let argument_groups = compiled.argument_buffers.iter().map(|_| None).collect();
        Self {
            gpu,
            compiled,
            programs: OnceLock::new(),
            resources: RwLock::new(resources),
            surface: Mutex::new(None),
            argument_groups: Mutex::new(argument_groups),
        }
    }

    pub(crate) fn set_programs(&self, programs: Vec<G::Program>) -> bool {
        self.programs.set(programs).is_ok()
    }

    pub fn programs(&self) -> &[G::Program] {
        self.programs.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn resources(&self) -> RwLockReadGuard<'_, ResourcePool<G>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn resources_mut(&self) -> RwLockWriteGuard<'_, ResourcePool<G>> {
        self.resources.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn surface(&self) -> Option<SurfaceInfo> {
        *self.surface.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_surface(&self, surface: SurfaceInfo) {
        *self.surface.lock().unwrap_or_else(PoisonError::into_inner) = Some(surface);
    }

    /// Bind group of an argument buffer, rebuilt when a member resource was
    /// replaced since the last call.
    pub(crate) fn argument_group(
        &self,
        id: ArgumentBufferId,
        resources: &ResourcePool<G>,
    ) -> Result<Arc<G::BindGroup>, PassError> {
        let layout = self
            .compiled
            .argument_buffer(id)
            .ok_or_else(|| PassError::Unbound {
                pass: format!("argument buffer #{}", id.0),
            })?;
        let mut groups = self
            .argument_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = groups.get_mut(id.0).ok_or_else(|| PassError::Unbound {
            pass: layout.name.clone(),
        })?;
        let stamp = pass::stamp(&layout.group, resources);
        if let Some(bound) = slot.as_ref().filter(|b| b.stamp == stamp) {
            return Ok(Arc::clone(&bound.group));
        }
        tracing::debug!("binding argument buffer '{}'", layout.name);
        let bound = pass::bind_group(&*self.gpu, &layout.name, &layout.group, resources, &[], None)?;
        let group = Arc::clone(&bound.group);
        *slot = Some(bound);
        Ok(group)
    }
}

/// What `setup` and `pre_run` see.
pub struct RenderInfo<'a, G: Gpu> {
    pub context: &'a Arc<GraphContext<G>>,
    pub resources: &'a ResourcePool<G>,
    pub surface: SurfaceInfo,
}

impl<G: Gpu> RenderInfo<'_, G> {
    pub fn gpu(&self) -> &G {
        &self.context.gpu
    }
}

/// What `encode` sees.
pub struct PassInfo<'a, G: Gpu> {
    pub gpu: &'a G,
    pub resources: &'a ResourcePool<G>,
    pub stream: &'a mut CommandStream<G>,
    /// The texture presented this frame; `None` off-frame.
    pub surface: Option<&'a G::Texture>,
    pub surface_info: SurfaceInfo,
    pub frame: u64,
}

// ---------------------------------------------------------------------------
// Command stream
// ---------------------------------------------------------------------------

/// The frame's command buffers. An encoder is opened on demand; committing
/// submits it and the next request opens a fresh one.
pub struct CommandStream<G: Gpu> {
    gpu: Arc<G>,
    label: String,
    encoder: Option<G::Encoder>,
    submissions: Vec<G::Submission>,
}

impl<G: Gpu> CommandStream<G> {
    pub fn new(gpu: Arc<G>, label: impl Into<String>) -> Self {
        Self {
            gpu,
            label: label.into(),
            encoder: None,
            submissions: Vec::new(),
        }
    }

    /// The active encoder, opening one if needed.
    pub fn encoder(&mut self) -> Result<&mut G::Encoder, GpuError> {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => self.gpu.create_encoder(&self.label)?,
        };
        Ok(self.encoder.insert(encoder))
    }

    /// Submit the active encoder, if any.
    pub fn commit(&mut self) -> Result<Option<G::Submission>, GpuError> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(None);
        };
        let submission = self.gpu.submit(encoder)?;
        self.submissions.push(submission.clone());
        Ok(Some(submission))
    }

    /// Submit and block until the GPU has finished everything so far.
    pub fn commit_and_wait(&mut self) -> Result<(), GpuError> {
        if let Some(submission) = self.commit()? {
            self.gpu.wait(&submission)?;
        }
        Ok(())
    }

    /// Submit what is left and return every submission of the frame.
    pub fn finish(mut self) -> Result<Vec<G::Submission>, GpuError> {
        self.commit()?;
        Ok(self.submissions)
    }

    pub fn submissions(&self) -> &[G::Submission] {
        &self.submissions
    }

    pub fn has_pending(&self) -> bool {
        self.encoder.is_some()
    }
}
