//! A GPU backend that records commands instead of executing them.
//!
//! Used by the headless CLI mode and by tests. Every created object gets a
//! unique id so tests can tell "same allocation" from "recreated".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use kiln_core::{DeviceCaps, Extent, PixelFormat, TextureDimension, TextureUsage};

use crate::binding::LayoutEntry;
use crate::filters::ImageFilter;
use crate::frame::SurfaceInfo;
use crate::gpu::{
    BoundResource, BufferSpec, CommandEncoder, ComputePipelineSpec, DispatchCommand,
    DispatchSize, DrawCommand, Gpu, GpuError, RenderPipelineSpec, TextureSpec,
};
use crate::validation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTexture {
    pub id: u64,
    pub label: String,
    pub extent: Extent,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuffer {
    pub id: u64,
    pub label: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct RecordedProgram {
    pub label: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPipeline {
    pub id: u64,
    pub label: String,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBindGroup {
    pub id: u64,
    pub label: String,
    /// Ids of the bound buffers and textures, by binding order.
    pub resources: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFilter {
    pub filter: ImageFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Dispatch {
        label: String,
        entry: String,
        size: DispatchSize,
        groups: Vec<u64>,
    },
    Draw {
        label: String,
        vertex_entry: String,
        vertices: u32,
        instances: u32,
        indexed: bool,
        targets: Vec<u64>,
    },
    CopyTexture { source: u64, destination: u64 },
    CopyBuffer { source: u64, destination: u64, size: u64 },
    ClearBuffer { buffer: u64 },
    Filter { name: String, source: u64, destination: u64 },
}

impl RecordedCommand {
    pub fn label(&self) -> &str {
        match self {
            Self::Dispatch { label, .. } | Self::Draw { label, .. } => label,
            Self::CopyTexture { .. } => "copy texture",
            Self::CopyBuffer { .. } => "copy buffer",
            Self::ClearBuffer { .. } => "clear buffer",
            Self::Filter { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub index: u64,
    pub label: String,
    pub commands: Vec<RecordedCommand>,
}

pub struct RecordingEncoder {
    label: String,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Default)]
struct Log {
    submissions: Vec<RecordedSubmission>,
    textures: Vec<RecordedTexture>,
    buffers: Vec<RecordedBuffer>,
    writes: Vec<(u64, u64, usize)>,
    programs: Vec<RecordedProgram>,
    failing_textures: Vec<String>,
}

#[derive(Debug)]
pub struct RecordingGpu {
    caps: DeviceCaps,
    validate: bool,
    next_id: AtomicU64,
    log: Mutex<Log>,
}

impl Default for RecordingGpu {
    fn default() -> Self {
        Self::new(DeviceCaps::default())
    }
}

impl RecordingGpu {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            validate: false,
            next_id: AtomicU64::new(1),
            log: Mutex::new(Log::default()),
        }
    }

    /// Validate every program with naga when it is created.
    pub fn validating(mut self) -> Self {
        self.validate = true;
        self
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.log().submissions.clone()
    }

    /// Every command of every submission, in submission order.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.log()
            .submissions
            .iter()
            .flat_map(|s| s.commands.iter().cloned())
            .collect()
    }

    pub fn textures_created(&self) -> Vec<RecordedTexture> {
        self.log().textures.clone()
    }

    pub fn buffers_created(&self) -> Vec<RecordedBuffer> {
        self.log().buffers.clone()
    }

    pub fn programs(&self) -> Vec<RecordedProgram> {
        self.log().programs.clone()
    }

    /// `(buffer id, offset, length)` of every host upload.
    pub fn writes(&self) -> Vec<(u64, u64, usize)> {
        self.log().writes.clone()
    }

    /// A stand-in for the texture a window surface would hand out.
    pub fn surface_texture(&self, surface: SurfaceInfo) -> Result<RecordedTexture, GpuError> {
        self.create_texture(&TextureSpec {
            label: "surface".into(),
            extent: surface.extent,
            dimension: TextureDimension::D2,
            format: surface.format,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::COPY_DST,
        })
    }

    /// Make the next creation of the texture labelled `label` fail once.
    pub fn fail_texture(&self, label: impl Into<String>) {
        self.log().failing_textures.push(label.into());
    }

    pub fn clear(&self) {
        let mut log = self.log();
        log.submissions.clear();
        log.writes.clear();
    }
}

impl Gpu for RecordingGpu {
    type Texture = RecordedTexture;
    type Buffer = RecordedBuffer;
    type Program = RecordedProgram;
    type ComputePipeline = RecordedPipeline;
    type RenderPipeline = RecordedPipeline;
    type BindGroup = RecordedBindGroup;
    type Filter = RecordedFilter;
    type Encoder = RecordingEncoder;
    type Submission = u64;

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_texture(&self, spec: &TextureSpec) -> Result<RecordedTexture, GpuError> {
        if spec.extent.volume() == 0 {
            return Err(GpuError::creation(&spec.label, "zero-sized texture"));
        }
        {
            let mut log = self.log();
            if let Some(i) = log.failing_textures.iter().position(|l| *l == spec.label) {
                log.failing_textures.remove(i);
                return Err(GpuError::creation(&spec.label, "injected failure"));
            }
        }
        let texture = RecordedTexture {
            id: self.id(),
            label: spec.label.clone(),
            extent: spec.extent,
            format: spec.format,
        };
        self.log().textures.push(texture.clone());
        Ok(texture)
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<RecordedBuffer, GpuError> {
        let buffer = RecordedBuffer {
            id: self.id(),
            label: spec.label.clone(),
            size: spec.size,
        };
        self.log().buffers.push(buffer.clone());
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: &RecordedBuffer, offset: u64, data: &[u8]) {
        self.log().writes.push((buffer.id, offset, data.len()));
    }

    fn create_program(&self, label: &str, source: &str) -> Result<RecordedProgram, GpuError> {
        if self.validate {
            validation::validate_unit(label, source)
                .map_err(|e| GpuError::creation(format!("program '{label}'"), e))?;
        }
        let program = RecordedProgram {
            label: label.to_string(),
            source: source.to_string(),
        };
        self.log().programs.push(program.clone());
        Ok(program)
    }

    fn create_compute_pipeline(
        &self,
        spec: &ComputePipelineSpec<'_, Self>,
    ) -> Result<RecordedPipeline, GpuError> {
        if !spec.program.source.contains(&format!("fn {}(", spec.entry)) {
            return Err(GpuError::creation(
                spec.label,
                format!("entry point `{}` not found", spec.entry),
            ));
        }
        Ok(RecordedPipeline {
            id: self.id(),
            label: spec.label.to_string(),
            entry: spec.entry.to_string(),
        })
    }

    fn create_render_pipeline(
        &self,
        spec: &RenderPipelineSpec<'_, Self>,
    ) -> Result<RecordedPipeline, GpuError> {
        for entry in [spec.vertex_entry, spec.fragment_entry] {
            if !spec.program.source.contains(&format!("fn {entry}(")) {
                return Err(GpuError::creation(
                    spec.label,
                    format!("entry point `{entry}` not found"),
                ));
            }
        }
        Ok(RecordedPipeline {
            id: self.id(),
            label: spec.label.to_string(),
            entry: spec.vertex_entry.to_string(),
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        layout: &[LayoutEntry],
        resources: &[BoundResource<'_, Self>],
    ) -> Result<RecordedBindGroup, GpuError> {
        if layout.len() != resources.len() {
            return Err(GpuError::creation(
                label,
                format!("{} layout entries but {} resources", layout.len(), resources.len()),
            ));
        }
        Ok(RecordedBindGroup {
            id: self.id(),
            label: label.to_string(),
            resources: resources
                .iter()
                .map(|r| match r {
                    BoundResource::Buffer(b) => b.id,
                    BoundResource::Texture(t) => t.id,
                })
                .collect(),
        })
    }

    fn create_filter(
        &self,
        filter: &ImageFilter,
        destination: PixelFormat,
    ) -> Result<RecordedFilter, GpuError> {
        if destination.storage_name().is_none() {
            return Err(GpuError::Unsupported(format!(
                "{} into {destination:?}",
                filter.name()
            )));
        }
        Ok(RecordedFilter { filter: *filter })
    }

    fn create_encoder(&self, label: &str) -> Result<RecordingEncoder, GpuError> {
        Ok(RecordingEncoder {
            label: label.to_string(),
            commands: Vec::new(),
        })
    }

    fn submit(&self, encoder: RecordingEncoder) -> Result<u64, GpuError> {
        let mut log = self.log();
        let index = log.submissions.len() as u64;
        tracing::trace!("submission {index}: {} commands", encoder.commands.len());
        log.submissions.push(RecordedSubmission {
            index,
            label: encoder.label,
            commands: encoder.commands,
        });
        Ok(index)
    }

    fn wait(&self, submission: &u64) -> Result<(), GpuError> {
        if *submission as usize >= self.log().submissions.len() {
            return Err(GpuError::Submission(format!("unknown submission {submission}")));
        }
        Ok(())
    }
}

impl CommandEncoder<RecordingGpu> for RecordingEncoder {
    fn dispatch(&mut self, command: &DispatchCommand<'_, RecordingGpu>) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::Dispatch {
            label: command.label.to_string(),
            entry: command.pipeline.entry.clone(),
            size: command.size,
            groups: command.groups.iter().map(|g| g.id).collect(),
        });
        Ok(())
    }

    fn draw(&mut self, command: &DrawCommand<'_, RecordingGpu>) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::Draw {
            label: command.label.to_string(),
            vertex_entry: command.pipeline.entry.clone(),
            vertices: command.vertices,
            instances: command.instances,
            indexed: command.index.is_some(),
            targets: command.colors.iter().map(|c| c.texture.id).collect(),
        });
        Ok(())
    }

    fn copy_texture(
        &mut self,
        source: &RecordedTexture,
        destination: &RecordedTexture,
        _extent: Extent,
    ) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::CopyTexture {
            source: source.id,
            destination: destination.id,
        });
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        source: &RecordedBuffer,
        destination: &RecordedBuffer,
        size: u64,
    ) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::CopyBuffer {
            source: source.id,
            destination: destination.id,
            size,
        });
        Ok(())
    }

    fn clear_buffer(&mut self, buffer: &RecordedBuffer) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::ClearBuffer { buffer: buffer.id });
        Ok(())
    }

    fn apply_filter(
        &mut self,
        filter: &RecordedFilter,
        source: &RecordedTexture,
        destination: &RecordedTexture,
        _extent: Extent,
    ) -> Result<(), GpuError> {
        self.commands.push(RecordedCommand::Filter {
            name: filter.filter.name().to_string(),
            source: source.id,
            destination: destination.id,
        });
        Ok(())
    }
}

/// Shared handle, as the pass graph wants an `Arc<G>`.
pub fn recording(caps: DeviceCaps) -> Arc<RecordingGpu> {
    Arc::new(RecordingGpu::new(caps))
}
