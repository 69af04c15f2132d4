//! The pass contract and the bind group plumbing shared by GPU passes.

use std::sync::Arc;

use kiln_core::{BufferHandle, BufferUsage, TextureHandle};
use thiserror::Error;

use crate::binding::{BindingSource, GroupBinding, GroupSpec, LayoutEntry};
use crate::compiler::BytesSlot;
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::{BoundResource, BufferSpec, Gpu, GpuError};
use crate::resources::ResourcePool;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    #[error("{pass}: {handle} is not materialized")]
    MissingTexture { pass: String, handle: TextureHandle },
    #[error("{pass}: {handle} is not materialized")]
    MissingBuffer { pass: String, handle: BufferHandle },
    #[error("{pass}: no display surface this frame")]
    NoSurface { pass: String },
    #[error("{pass} was encoded before setup")]
    Unbound { pass: String },
    #[error("{pass}: {source}")]
    Gpu {
        pass: String,
        #[source]
        source: GpuError,
    },
    #[error("{pass}: {message}")]
    Callback { pass: String, message: String },
}

impl PassError {
    pub fn gpu(pass: &str, source: GpuError) -> Self {
        Self::Gpu {
            pass: pass.to_string(),
            source,
        }
    }

    pub fn callback(pass: &str, message: impl Into<String>) -> Self {
        Self::Callback {
            pass: pass.to_string(),
            message: message.into(),
        }
    }
}

/// A node of the built pass graph.
pub trait Pass<G: Gpu>: Send {
    fn label(&self) -> &str;

    /// One-time: pipelines, filters and bind groups.
    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError>;

    /// Once per frame before encoding: rebind replaced resources, upload
    /// host values.
    fn pre_run(&mut self, _info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError>;
}

// ---------------------------------------------------------------------------
// Bind groups
// ---------------------------------------------------------------------------

/// A created bind group and the resource generations it was built from.
pub(crate) struct BoundGroup<G: Gpu> {
    pub group: Arc<G::BindGroup>,
    pub stamp: Vec<u64>,
}

/// Generations of the resources behind `spec`, in binding order.
pub(crate) fn stamp<G: Gpu>(spec: &GroupSpec, resources: &ResourcePool<G>) -> Vec<u64> {
    spec.bindings
        .iter()
        .map(|binding| match binding.source {
            BindingSource::Buffer(h) => resources.buffer_generation(h).unwrap_or(u64::MAX),
            BindingSource::Texture(h) => resources.texture_generation(h).unwrap_or(u64::MAX),
            BindingSource::Bytes(_) | BindingSource::GridExtent => 0,
        })
        .collect()
}

pub(crate) fn bind_group<G: Gpu>(
    gpu: &G,
    label: &str,
    spec: &GroupSpec,
    resources: &ResourcePool<G>,
    bytes: &[G::Buffer],
    grid: Option<&G::Buffer>,
) -> Result<BoundGroup<G>, PassError> {
    let mut bound = Vec::with_capacity(spec.bindings.len());
    for binding in &spec.bindings {
        let resource = match binding.source {
            BindingSource::Buffer(handle) => BoundResource::Buffer(
                resources
                    .buffer(handle)
                    .ok_or_else(|| PassError::MissingBuffer {
                        pass: label.to_string(),
                        handle,
                    })?,
            ),
            BindingSource::Texture(handle) => BoundResource::Texture(
                resources
                    .texture(handle)
                    .ok_or_else(|| PassError::MissingTexture {
                        pass: label.to_string(),
                        handle,
                    })?,
            ),
            BindingSource::Bytes(slot) => {
                BoundResource::Buffer(bytes.get(slot).ok_or_else(|| PassError::Unbound {
                    pass: format!("{label} ({})", binding.name),
                })?)
            }
            BindingSource::GridExtent => {
                BoundResource::Buffer(grid.ok_or_else(|| PassError::Unbound {
                    pass: format!("{label} ({})", binding.name),
                })?)
            }
        };
        bound.push(resource);
    }
    let layout: Vec<LayoutEntry> = spec.layout();
    let group = gpu
        .create_bind_group(label, &layout, &bound)
        .map_err(|e| PassError::gpu(label, e))?;
    Ok(BoundGroup {
        group: Arc::new(group),
        stamp: stamp(spec, resources),
    })
}

/// Everything a dispatch or draw binds: its own groups, shared argument
/// buffers, uniform blocks for bytes arguments and the grid extent.
pub(crate) struct Bindings<G: Gpu> {
    label: String,
    groups: Vec<GroupBinding>,
    bytes: Vec<BytesSlot>,
    bytes_buffers: Vec<G::Buffer>,
    grid_buffer: Option<G::Buffer>,
    own: Vec<Option<BoundGroup<G>>>,
    resolved: Vec<Arc<G::BindGroup>>,
}

impl<G: Gpu> Bindings<G> {
    pub fn new(label: &str, groups: Vec<GroupBinding>, bytes: Vec<BytesSlot>) -> Self {
        Self {
            label: label.to_string(),
            own: groups.iter().map(|_| None).collect(),
            groups,
            bytes,
            bytes_buffers: Vec::new(),
            grid_buffer: None,
            resolved: Vec::new(),
        }
    }

    pub fn groups(&self) -> &[GroupBinding] {
        &self.groups
    }

    fn wants_grid(&self) -> bool {
        self.groups.iter().any(|group| match group {
            GroupBinding::Own(spec) => spec
                .bindings
                .iter()
                .any(|b| b.source == BindingSource::GridExtent),
            GroupBinding::Shared(_) => false,
        })
    }

    /// Allocate the uniform blocks and build every bind group.
    pub fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let gpu = info.gpu();
        self.bytes_buffers.clear();
        for slot in &self.bytes {
            let buffer = gpu
                .create_buffer(&BufferSpec {
                    label: format!("{} {}", self.label, slot.name),
                    size: slot.size,
                    usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                })
                .map_err(|e| PassError::gpu(&self.label, e))?;
            self.bytes_buffers.push(buffer);
        }
        if self.wants_grid() {
            let buffer = gpu
                .create_buffer(&BufferSpec {
                    label: format!("{} grid", self.label),
                    size: 16,
                    usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                })
                .map_err(|e| PassError::gpu(&self.label, e))?;
            self.grid_buffer = Some(buffer);
        }
        self.refresh(info)
    }

    /// Rebuild groups whose resources were replaced.
    pub fn refresh(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let mut resolved = Vec::with_capacity(self.groups.len());
        for (index, group) in self.groups.iter().enumerate() {
            match group {
                GroupBinding::Own(spec) => {
                    let current = stamp(spec, info.resources);
                    let fresh = self.own[index].as_ref().is_some_and(|b| b.stamp == current);
                    if !fresh {
                        let bound = bind_group(
                            info.gpu(),
                            &self.label,
                            spec,
                            info.resources,
                            &self.bytes_buffers,
                            self.grid_buffer.as_ref(),
                        )?;
                        if self.own[index].is_some() {
                            tracing::debug!("{}: rebuilt bind group {index}", self.label);
                        }
                        self.own[index] = Some(bound);
                    }
                    if let Some(bound) = &self.own[index] {
                        resolved.push(Arc::clone(&bound.group));
                    }
                }
                GroupBinding::Shared(id) => {
                    resolved.push(info.context.argument_group(*id, info.resources)?);
                }
            }
        }
        self.resolved = resolved;
        Ok(())
    }

    /// Upload the current value of every bytes argument.
    pub fn upload(&self, gpu: &G) {
        for (slot, buffer) in self.bytes.iter().zip(&self.bytes_buffers) {
            let mut data = slot.source.bytes();
            data.resize(slot.size as usize, 0);
            gpu.write_buffer(buffer, 0, &data);
        }
    }

    pub fn write_grid(&self, gpu: &G, bytes: &[u8]) {
        if let Some(buffer) = &self.grid_buffer {
            gpu.write_buffer(buffer, 0, bytes);
        }
    }

    pub fn bound(&self) -> Result<Vec<&G::BindGroup>, PassError> {
        if self.resolved.len() != self.groups.len() {
            return Err(PassError::Unbound {
                pass: self.label.clone(),
            });
        }
        Ok(self.resolved.iter().map(|g| &**g).collect())
    }
}
