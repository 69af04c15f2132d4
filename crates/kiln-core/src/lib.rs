//! kiln core: the GPU-agnostic half of the frame compiler.
//!
//! Describes host data layouts, resource declarations, shader arguments and
//! grid fits, and provides the textual signature patcher the compiler uses
//! to splice generated parameters into hand-written WGSL.

pub mod argument;
pub mod error;
pub mod flags;
pub mod grid;
pub mod layout;
pub mod patcher;
pub mod resource;

pub use argument::{Argument, ArgumentKind, BufferSpace, IndexSpace, TextureAccess};
pub use error::CompileError;
pub use flags::{BytesSource, Counter, Flag, Uniform};
pub use grid::{DeviceCaps, GridDims, GridPlan, GridSource};
pub use layout::{GpuLayout, GpuType, ScalarType, StructDecl, SymbolTable};
pub use resource::{
    BufferDecl, BufferHandle, BufferUsage, ElementCount, Extent, FormatPolicy, PixelFormat,
    ResourceSize, ResourceTable, TextureDecl, TextureDimension, TextureHandle, TextureRef,
    TextureUsage,
};
