//! Bind group layouts produced by the compiler.

use bitflags::bitflags;
use kiln_core::resource::SampleKind;
use kiln_core::{BufferHandle, PixelFormat, TextureDimension, TextureHandle};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageMask: u8 {
        const COMPUTE = 1 << 0;
        const VERTEX = 1 << 1;
        const FRAGMENT = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform,
    Storage { read_only: bool },
    Texture {
        dimension: TextureDimension,
        sample: SampleKind,
    },
    StorageTexture {
        dimension: TextureDimension,
        format: PixelFormat,
        read_write: bool,
    },
}

/// One slot of a bind group layout. Equal entries describe equal layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
    pub visibility: StageMask,
}

/// What feeds a binding at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingSource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    /// Uniform block owned by the pass, uploaded from a bytes argument.
    Bytes(usize),
    /// Uniform block holding the dispatch grid extent.
    GridExtent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingSpec {
    pub name: String,
    pub entry: LayoutEntry,
    pub source: BindingSource,
}

/// Bind group contents of one leaf or argument buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub bindings: Vec<BindingSpec>,
}

impl GroupSpec {
    pub fn layout(&self) -> Vec<LayoutEntry> {
        self.bindings.iter().map(|b| b.entry).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgumentBufferId(pub usize);

/// A bind group slot of a compiled leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupBinding {
    /// Bindings owned by this leaf.
    Own(GroupSpec),
    /// A named argument buffer shared by every leaf that references it.
    Shared(ArgumentBufferId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentBufferLayout {
    pub name: String,
    pub group: GroupSpec,
}
