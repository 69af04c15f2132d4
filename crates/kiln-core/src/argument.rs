//! Arguments of a leaf shader function.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::flags::{BytesSource, Uniform};
use crate::layout::GpuLayout;
use crate::resource::{BufferHandle, TextureHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSpace {
    Uniform,
    Storage { read_only: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureAccess {
    /// Sampled / loaded texture.
    Sample,
    /// Write-only storage texture.
    Write,
    ReadWrite,
}

/// The two per-function index spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSpace {
    /// Buffers and bytes.
    Buffers,
    Textures,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffers => f.write_str("buffer"),
            Self::Textures => f.write_str("texture"),
        }
    }
}

#[derive(Clone)]
pub enum ArgumentKind {
    Buffer {
        buffer: BufferHandle,
        space: BufferSpace,
    },
    Bytes(Arc<dyn BytesSource>),
    Texture {
        texture: TextureHandle,
        access: TextureAccess,
    },
    /// A named, shareable block of buffer and texture bindings.
    ArgumentBuffer { name: String, members: Vec<Argument> },
}

impl fmt::Debug for ArgumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer { buffer, space } => f
                .debug_struct("Buffer")
                .field("buffer", buffer)
                .field("space", space)
                .finish(),
            Self::Bytes(source) => f
                .debug_tuple("Bytes")
                .field(&source.gpu_type())
                .finish(),
            Self::Texture { texture, access } => f
                .debug_struct("Texture")
                .field("texture", texture)
                .field("access", access)
                .finish(),
            Self::ArgumentBuffer { name, members } => f
                .debug_struct("ArgumentBuffer")
                .field("name", name)
                .field("members", members)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    /// Caller-pinned index, otherwise the next free one is assigned.
    pub index: Option<u32>,
    /// Caller-supplied WGSL type, used verbatim instead of synthesis.
    pub gpu_type: Option<String>,
    pub kind: ArgumentKind,
}

impl Argument {
    fn with_kind(name: impl Into<String>, kind: ArgumentKind) -> Self {
        Self {
            name: name.into(),
            index: None,
            gpu_type: None,
            kind,
        }
    }

    /// Read-write storage buffer.
    pub fn buffer(name: impl Into<String>, buffer: BufferHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Buffer {
                buffer,
                space: BufferSpace::Storage { read_only: false },
            },
        )
    }

    pub fn read_buffer(name: impl Into<String>, buffer: BufferHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Buffer {
                buffer,
                space: BufferSpace::Storage { read_only: true },
            },
        )
    }

    /// Buffer bound as a uniform block holding one element.
    pub fn uniform_buffer(name: impl Into<String>, buffer: BufferHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Buffer {
                buffer,
                space: BufferSpace::Uniform,
            },
        )
    }

    /// Host value uploaded as a uniform block every frame it is bound.
    pub fn bytes<T>(name: impl Into<String>, value: &Uniform<T>) -> Self
    where
        T: GpuLayout + Pod + Send + Sync + 'static,
    {
        Self::with_kind(name, ArgumentKind::Bytes(Arc::new(value.clone())))
    }

    /// Constant host value.
    pub fn constant<T>(name: impl Into<String>, value: T) -> Self
    where
        T: GpuLayout + Pod + Send + Sync + 'static,
    {
        Self::bytes(name, &Uniform::new(value))
    }

    pub fn from_source(name: impl Into<String>, source: Arc<dyn BytesSource>) -> Self {
        Self::with_kind(name, ArgumentKind::Bytes(source))
    }

    pub fn texture(name: impl Into<String>, texture: TextureHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Texture {
                texture,
                access: TextureAccess::Sample,
            },
        )
    }

    pub fn write_texture(name: impl Into<String>, texture: TextureHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Texture {
                texture,
                access: TextureAccess::Write,
            },
        )
    }

    pub fn read_write_texture(name: impl Into<String>, texture: TextureHandle) -> Self {
        Self::with_kind(
            name,
            ArgumentKind::Texture {
                texture,
                access: TextureAccess::ReadWrite,
            },
        )
    }

    /// Named argument buffer. Every use of the same name within one compile
    /// binds the same block, so every use must list the same members.
    pub fn argument_buffer(name: impl Into<String>, members: Vec<Argument>) -> Self {
        let name = name.into();
        Self::with_kind(
            name.clone(),
            ArgumentKind::ArgumentBuffer { name, members },
        )
    }

    pub fn at_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_type(mut self, ty: impl Into<String>) -> Self {
        self.gpu_type = Some(ty.into());
        self
    }

    /// The index space this argument draws from. Argument buffers have
    /// their own group and take no index.
    pub fn space(&self) -> Option<IndexSpace> {
        match self.kind {
            ArgumentKind::Buffer { .. } | ArgumentKind::Bytes(_) => Some(IndexSpace::Buffers),
            ArgumentKind::Texture { .. } => Some(IndexSpace::Textures),
            ArgumentKind::ArgumentBuffer { .. } => None,
        }
    }

    pub fn texture_handle(&self) -> Option<TextureHandle> {
        match self.kind {
            ArgumentKind::Texture { texture, .. } => Some(texture),
            _ => None,
        }
    }

    pub fn buffer_handle(&self) -> Option<BufferHandle> {
        match self.kind {
            ArgumentKind::Buffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceTable;

    #[test]
    fn test_argument_spaces() {
        let mut table = ResourceTable::new();
        let buf = table.buffer::<f32>("values", 8);
        assert_eq!(Argument::buffer("values", buf).space(), Some(IndexSpace::Buffers));
        assert_eq!(Argument::constant("scale", 2.0f32).space(), Some(IndexSpace::Buffers));
        assert_eq!(
            Argument::argument_buffer("shared", vec![Argument::read_buffer("values", buf)]).space(),
            None
        );
    }

    #[test]
    fn test_builder_options() {
        let mut table = ResourceTable::new();
        let buf = table.buffer::<u32>("ids", 4);
        let arg = Argument::read_buffer("ids", buf).at_index(3).with_type("array<u32>");
        assert_eq!(arg.index, Some(3));
        assert_eq!(arg.gpu_type.as_deref(), Some("array<u32>"));
        assert_eq!(arg.buffer_handle(), Some(buf));
        assert_eq!(arg.texture_handle(), None);
    }
}
