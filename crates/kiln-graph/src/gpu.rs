//! The seam between the pass graph and a GPU API.
//!
//! Passes only ever talk to [`Gpu`] and [`CommandEncoder`]. The wgpu backend
//! drives real hardware; the recording backend logs commands for headless
//! runs and tests.

use std::fmt;

use kiln_core::{BufferUsage, DeviceCaps, Extent, PixelFormat, TextureDimension, TextureUsage};
use thiserror::Error;

use crate::binding::LayoutEntry;
use crate::component::{BlendMode, LoadAction, Topology};
use crate::filters::ImageFilter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("failed to create {what}: {message}")]
    Creation { what: String, message: String },
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("{0} is not supported by this device")]
    Unsupported(String),
}

impl GpuError {
    pub fn creation(what: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Creation {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSpec {
    pub label: String,
    pub extent: Extent,
    pub dimension: TextureDimension,
    pub format: PixelFormat,
    pub usage: TextureUsage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTargetSpec {
    pub format: PixelFormat,
    pub blend: BlendMode,
}

pub struct ComputePipelineSpec<'a, G: Gpu> {
    pub label: &'a str,
    pub program: &'a G::Program,
    pub entry: &'a str,
    /// Layout of each bind group, by group number.
    pub groups: &'a [Vec<LayoutEntry>],
}

pub struct RenderPipelineSpec<'a, G: Gpu> {
    pub label: &'a str,
    pub program: &'a G::Program,
    pub vertex_entry: &'a str,
    pub fragment_entry: &'a str,
    pub groups: &'a [Vec<LayoutEntry>],
    pub targets: &'a [ColorTargetSpec],
    pub depth: Option<PixelFormat>,
    pub topology: Topology,
}

pub enum BoundResource<'a, G: Gpu> {
    Buffer(&'a G::Buffer),
    Texture(&'a G::Texture),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSize {
    Workgroups([u32; 3]),
    /// Exact thread counts, for devices with non-uniform dispatch.
    Threads { threads: [u32; 3], workgroup: [u32; 3] },
}

impl DispatchSize {
    /// Workgroup counts covering this dispatch.
    pub fn workgroups(self) -> [u32; 3] {
        match self {
            Self::Workgroups(groups) => groups,
            Self::Threads { threads, workgroup } => [
                threads[0].div_ceil(workgroup[0].max(1)),
                threads[1].div_ceil(workgroup[1].max(1)),
                threads[2].div_ceil(workgroup[2].max(1)),
            ],
        }
    }
}

pub struct DispatchCommand<'a, G: Gpu> {
    pub label: &'a str,
    pub pipeline: &'a G::ComputePipeline,
    pub groups: &'a [&'a G::BindGroup],
    pub size: DispatchSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

pub struct IndexBinding<'a, G: Gpu> {
    pub buffer: &'a G::Buffer,
    pub format: IndexFormat,
    pub count: u32,
}

pub struct ColorAttachment<'a, G: Gpu> {
    pub texture: &'a G::Texture,
    pub load: LoadAction,
}

pub struct DepthAttachment<'a, G: Gpu> {
    pub texture: &'a G::Texture,
    /// `None` loads the existing depth.
    pub clear: Option<f32>,
}

pub struct DrawCommand<'a, G: Gpu> {
    pub label: &'a str,
    pub pipeline: &'a G::RenderPipeline,
    pub groups: &'a [&'a G::BindGroup],
    pub colors: &'a [ColorAttachment<'a, G>],
    pub depth: Option<DepthAttachment<'a, G>>,
    pub vertices: u32,
    pub instances: u32,
    pub index: Option<IndexBinding<'a, G>>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Records GPU commands into one command buffer.
pub trait CommandEncoder<G: Gpu>: Send {
    fn dispatch(&mut self, command: &DispatchCommand<'_, G>) -> Result<(), GpuError>;
    fn draw(&mut self, command: &DrawCommand<'_, G>) -> Result<(), GpuError>;
    fn copy_texture(
        &mut self,
        source: &G::Texture,
        destination: &G::Texture,
        extent: Extent,
    ) -> Result<(), GpuError>;
    fn copy_buffer(
        &mut self,
        source: &G::Buffer,
        destination: &G::Buffer,
        size: u64,
    ) -> Result<(), GpuError>;
    fn clear_buffer(&mut self, buffer: &G::Buffer) -> Result<(), GpuError>;
    fn apply_filter(
        &mut self,
        filter: &G::Filter,
        source: &G::Texture,
        destination: &G::Texture,
        extent: Extent,
    ) -> Result<(), GpuError>;
}

/// Device-level operations.
pub trait Gpu: Send + Sync + Sized + 'static {
    type Texture: Send + Sync;
    type Buffer: Send + Sync;
    type Program: Send + Sync;
    type ComputePipeline: Send + Sync;
    type RenderPipeline: Send + Sync;
    type BindGroup: Send + Sync;
    type Filter: Send + Sync;
    type Encoder: CommandEncoder<Self>;
    type Submission: Clone + fmt::Debug + Send + Sync;

    fn caps(&self) -> DeviceCaps;

    fn create_texture(&self, spec: &TextureSpec) -> Result<Self::Texture, GpuError>;
    fn create_buffer(&self, spec: &BufferSpec) -> Result<Self::Buffer, GpuError>;
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]);

    fn create_program(&self, label: &str, source: &str) -> Result<Self::Program, GpuError>;
    fn create_compute_pipeline(
        &self,
        spec: &ComputePipelineSpec<'_, Self>,
    ) -> Result<Self::ComputePipeline, GpuError>;
    fn create_render_pipeline(
        &self,
        spec: &RenderPipelineSpec<'_, Self>,
    ) -> Result<Self::RenderPipeline, GpuError>;
    fn create_bind_group(
        &self,
        label: &str,
        layout: &[LayoutEntry],
        resources: &[BoundResource<'_, Self>],
    ) -> Result<Self::BindGroup, GpuError>;
    fn create_filter(
        &self,
        filter: &ImageFilter,
        destination: PixelFormat,
    ) -> Result<Self::Filter, GpuError>;

    fn create_encoder(&self, label: &str) -> Result<Self::Encoder, GpuError>;
    fn submit(&self, encoder: Self::Encoder) -> Result<Self::Submission, GpuError>;
    /// Block until `submission` has finished on the GPU.
    fn wait(&self, submission: &Self::Submission) -> Result<(), GpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_dispatch_rounds_to_workgroups() {
        let size = DispatchSize::Threads {
            threads: [100, 9, 1],
            workgroup: [8, 8, 1],
        };
        assert_eq!(size.workgroups(), [13, 2, 1]);
        assert_eq!(DispatchSize::Workgroups([2, 3, 4]).workgroups(), [2, 3, 4]);
    }
}
