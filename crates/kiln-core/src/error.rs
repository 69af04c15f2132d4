use thiserror::Error;

use crate::argument::IndexSpace;
use crate::grid::GridError;
use crate::layout::LayoutError;
use crate::patcher::PatchError;
use crate::resource::{BufferHandle, TextureHandle};

/// Authoring errors. Any of them aborts compilation of the program unit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("`{function}`: {source}")]
    Patch {
        function: String,
        #[source]
        source: PatchError,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("`{function}` declares argument `{name}` twice")]
    DuplicateName { function: String, name: String },
    #[error("`{function}` pins {space} index {index} twice")]
    DuplicateIndex {
        function: String,
        space: IndexSpace,
        index: u32,
    },
    #[error("`{function}` references unknown {handle}")]
    UnknownTexture {
        function: String,
        handle: TextureHandle,
    },
    #[error("`{function}` references unknown {handle}")]
    UnknownBuffer {
        function: String,
        handle: BufferHandle,
    },
    #[error("index buffer of `{function}` must hold u16 or u32 elements")]
    BadIndexType { function: String },
    #[error("`{function}` writes texture `{texture}` whose format {format} is not storage-capable")]
    NotStorageFormat {
        function: String,
        texture: String,
        format: String,
    },
    #[error("`{function}` binds cube texture `{texture}` as a storage texture")]
    CubeStorage { function: String, texture: String },
    #[error("argument buffer `{name}` may only hold buffers and textures, `{member}` is neither")]
    BadArgumentBufferMember { name: String, member: String },
    #[error("`{function}` redefines argument buffer `{name}` with different members")]
    ArgumentBufferRedefined { function: String, name: String },
    #[error("`{function}` has a @workgroup_size that is not a list of integer literals")]
    WorkgroupSize { function: String },
    #[error("`{function}` has no colour target")]
    NoTargets { function: String },
}

impl CompileError {
    pub fn patch(function: &str, source: PatchError) -> Self {
        Self::Patch {
            function: function.to_string(),
            source,
        }
    }
}
