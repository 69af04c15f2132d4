//! kiln graph: compiles a component tree into WGSL programs and a pass
//! graph, and drives that graph frame by frame on a [`Gpu`].
//!
//! The usual flow is [`Program`] → [`PassGraph::build`] →
//! [`PassGraph::setup`] → [`PassGraph::encode`] once per frame. Work that
//! should not block frames goes under an [`AsyncGroup`] and is started
//! through its [`AsyncGroupHandle`].

pub mod async_group;
pub mod binding;
pub mod compiler;
pub mod component;
pub mod filters;
pub mod flatten;
pub mod frame;
pub mod gpu;
pub mod graph;
pub mod pass;
pub mod passes;
pub mod recording;
pub mod resources;
pub mod validation;
pub mod wgpu_backend;

pub use async_group::{AsyncError, AsyncGroupHandle, AsyncParameters, AsyncState};
pub use compiler::{compile, CompileOptions, CompiledProgram};
pub use component::{
    AsyncGroup, Blit, BlendMode, Component, Dispatch, Draw, Group, LoadAction, ManualCallback,
    Program, Topology, VendorFilter,
};
pub use filters::ImageFilter;
pub use frame::{CommandStream, GraphContext, PassInfo, RenderInfo, SurfaceInfo};
pub use gpu::{CommandEncoder, Gpu, GpuError};
pub use graph::{GraphError, GraphOptions, PassGraph};
pub use pass::{Pass, PassError};
pub use recording::RecordingGpu;
pub use wgpu_backend::{WgpuGpu, WgpuTexture};
