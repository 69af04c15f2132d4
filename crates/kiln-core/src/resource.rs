//! Resource declarations: textures and buffers addressed by stable handles.
//!
//! A [`ResourceTable`] is the arena the caller fills before compiling. The
//! pass graph materializes GPU objects for the entries the compiled program
//! actually uses and tracks them by the same handles.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::layout::{GpuLayout, GpuType};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u32);

impl TextureHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BufferHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// A texture operand that may also be the per-frame display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureRef {
    Resource(TextureHandle),
    Surface,
}

impl From<TextureHandle> for TextureRef {
    fn from(handle: TextureHandle) -> Self {
        Self::Resource(handle)
    }
}

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub const fn flat(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    pub fn axes(self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn volume(self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

impl From<[u32; 3]> for Extent {
    fn from(axes: [u32; 3]) -> Self {
        Self::new(axes[0], axes[1], axes[2])
    }
}

impl From<(u32, u32)> for Extent {
    fn from((width, height): (u32, u32)) -> Self {
        Self::flat(width, height)
    }
}

impl From<u32> for Extent {
    fn from(width: u32) -> Self {
        Self::new(width, 1, 1)
    }
}

/// Size policy of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSize {
    /// Same size as the display surface.
    Viewport,
    /// Display surface size divided by N.
    ViewportDiv(u32),
    /// Fixed width and height.
    Fixed(u32, u32),
}

impl ResourceSize {
    pub fn is_surface_derived(self) -> bool {
        !matches!(self, Self::Fixed(..))
    }

    pub fn resolve(self, surface: Extent) -> (u32, u32) {
        match self {
            Self::Viewport => (surface.width.max(1), surface.height.max(1)),
            Self::ViewportDiv(div) => {
                let div = div.max(1);
                ((surface.width / div).max(1), (surface.height / div).max(1))
            }
            Self::Fixed(w, h) => (w, h),
        }
    }

    /// Parse the size notation used in config files: `viewport`,
    /// `viewport/2`, `512x256`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text == "viewport" {
            return Some(Self::Viewport);
        }
        if let Some(div) = text.strip_prefix("viewport/") {
            return div.parse().ok().filter(|d| *d > 0).map(Self::ViewportDiv);
        }
        let (w, h) = text.split_once('x')?;
        Some(Self::Fixed(w.parse().ok()?, h.parse().ok()?))
    }
}

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown texture format '{0}'")]
pub struct UnknownFormat(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    R32Sint,
    Rgba32Uint,
    Depth32Float,
}

/// How a shader samples a texture of a given format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Float,
    Uint,
    Sint,
    Depth,
}

impl PixelFormat {
    pub fn from_name(name: &str) -> Result<Self, UnknownFormat> {
        Ok(match name {
            "r8unorm" => Self::R8Unorm,
            "rg8unorm" => Self::Rg8Unorm,
            "rgba8unorm" => Self::Rgba8Unorm,
            "rgba8unorm-srgb" => Self::Rgba8UnormSrgb,
            "bgra8unorm" => Self::Bgra8Unorm,
            "bgra8unorm-srgb" => Self::Bgra8UnormSrgb,
            "r16float" => Self::R16Float,
            "rg16float" => Self::Rg16Float,
            "rgba16float" => Self::Rgba16Float,
            "r32float" => Self::R32Float,
            "rg32float" => Self::Rg32Float,
            "rgba32float" => Self::Rgba32Float,
            "r32uint" => Self::R32Uint,
            "r32sint" => Self::R32Sint,
            "rgba32uint" => Self::Rgba32Uint,
            "depth32float" => Self::Depth32Float,
            other => return Err(UnknownFormat(other.to_string())),
        })
    }

    /// Texel format name usable in a WGSL `texture_storage_*` type.
    pub fn storage_name(self) -> Option<&'static str> {
        match self {
            Self::Rgba8Unorm => Some("rgba8unorm"),
            Self::Rgba16Float => Some("rgba16float"),
            Self::R32Float => Some("r32float"),
            Self::Rg32Float => Some("rg32float"),
            Self::Rgba32Float => Some("rgba32float"),
            Self::R32Uint => Some("r32uint"),
            Self::R32Sint => Some("r32sint"),
            Self::Rgba32Uint => Some("rgba32uint"),
            _ => None,
        }
    }

    pub fn sample_kind(self) -> SampleKind {
        match self {
            Self::R32Uint | Self::Rgba32Uint => SampleKind::Uint,
            Self::R32Sint => SampleKind::Sint,
            Self::Depth32Float => SampleKind::Depth,
            _ => SampleKind::Float,
        }
    }

    /// Whether textures of this format can be sampled with filtering.
    pub fn is_filterable(self) -> bool {
        !matches!(
            self,
            Self::R32Float
                | Self::Rg32Float
                | Self::Rgba32Float
                | Self::R32Uint
                | Self::R32Sint
                | Self::Rgba32Uint
                | Self::Depth32Float
        )
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float => 2,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Rg16Float
            | Self::R32Float
            | Self::R32Uint
            | Self::R32Sint
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Rg32Float => 8,
            Self::Rgba32Float | Self::Rgba32Uint => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPolicy {
    Fixed(PixelFormat),
    /// Whatever format the display surface currently has.
    Surface,
}

impl FormatPolicy {
    pub fn resolve(self, surface: PixelFormat) -> PixelFormat {
        match self {
            Self::Fixed(format) => format,
            Self::Surface => surface,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D2Array,
    D3,
    Cube,
}

impl TextureDimension {
    /// Suffix of the WGSL texture type, as in `texture_2d_array`.
    pub fn wgsl_suffix(self) -> &'static str {
        match self {
            Self::D1 => "1d",
            Self::D2 => "2d",
            Self::D2Array => "2d_array",
            Self::D3 => "3d",
            Self::Cube => "cube",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const INDEX = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDecl {
    pub name: String,
    pub size: ResourceSize,
    /// Depth for 3D textures, layer count for arrays (6 for cubes).
    pub layers: u32,
    pub dimension: TextureDimension,
    pub format: FormatPolicy,
}

impl TextureDecl {
    pub fn new(name: impl Into<String>, size: ResourceSize, format: PixelFormat) -> Self {
        Self {
            name: name.into(),
            size,
            layers: 1,
            dimension: TextureDimension::D2,
            format: FormatPolicy::Fixed(format),
        }
    }

    /// A texture that follows the display surface in both size and format.
    pub fn surface_like(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: ResourceSize::Viewport,
            layers: 1,
            dimension: TextureDimension::D2,
            format: FormatPolicy::Surface,
        }
    }

    pub fn with_dimension(mut self, dimension: TextureDimension, layers: u32) -> Self {
        self.dimension = dimension;
        self.layers = match dimension {
            TextureDimension::Cube => 6,
            _ => layers.max(1),
        };
        self
    }

    pub fn is_surface_derived(&self) -> bool {
        self.size.is_surface_derived() || self.format == FormatPolicy::Surface
    }

    pub fn extent(&self, surface: Extent) -> Extent {
        let (width, height) = self.size.resolve(surface);
        match self.dimension {
            TextureDimension::D1 => Extent::new(width, 1, 1),
            _ => Extent::new(width, height, self.layers),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementCount {
    Fixed(u64),
    /// N elements per display-surface pixel.
    PerPixel(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDecl {
    pub name: String,
    pub element: GpuType,
    pub element_size: u64,
    pub count: ElementCount,
}

impl BufferDecl {
    pub fn new<T: GpuLayout>(name: impl Into<String>, count: ElementCount) -> Self {
        Self {
            name: name.into(),
            element: T::gpu_type(),
            element_size: std::mem::size_of::<T>() as u64,
            count,
        }
    }

    pub fn is_surface_derived(&self) -> bool {
        matches!(self.count, ElementCount::PerPixel(_))
    }

    pub fn element_count(&self, surface: Extent) -> u64 {
        match self.count {
            ElementCount::Fixed(n) => n,
            ElementCount::PerPixel(n) => {
                surface.width as u64 * surface.height as u64 * n as u64
            }
        }
    }

    /// Allocation size in bytes, rounded up to a multiple of 16 and never zero.
    pub fn byte_size(&self, surface: Extent) -> u64 {
        let raw = self.element_count(surface) * self.element_size;
        raw.max(16).div_ceil(16) * 16
    }
}

/// The caller's resource arena.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    textures: Vec<TextureDecl>,
    buffers: Vec<BufferDecl>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_texture(&mut self, decl: TextureDecl) -> TextureHandle {
        self.textures.push(decl);
        TextureHandle(self.textures.len() as u32 - 1)
    }

    pub fn add_buffer(&mut self, decl: BufferDecl) -> BufferHandle {
        self.buffers.push(decl);
        BufferHandle(self.buffers.len() as u32 - 1)
    }

    /// Shorthand for a buffer of `count` elements of `T`.
    pub fn buffer<T: GpuLayout>(&mut self, name: &str, count: u64) -> BufferHandle {
        self.add_buffer(BufferDecl::new::<T>(name, ElementCount::Fixed(count)))
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&TextureDecl> {
        self.textures.get(handle.index())
    }

    pub fn buffer_decl(&self, handle: BufferHandle) -> Option<&BufferDecl> {
        self.buffers.get(handle.index())
    }

    pub fn textures(&self) -> impl Iterator<Item = (TextureHandle, &TextureDecl)> {
        self.textures
            .iter()
            .enumerate()
            .map(|(i, d)| (TextureHandle(i as u32), d))
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferHandle, &BufferDecl)> {
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, d)| (BufferHandle(i as u32), d))
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_size_parse() {
        assert_eq!(ResourceSize::parse("viewport"), Some(ResourceSize::Viewport));
        assert_eq!(
            ResourceSize::parse("viewport/4"),
            Some(ResourceSize::ViewportDiv(4))
        );
        assert_eq!(
            ResourceSize::parse("512x256"),
            Some(ResourceSize::Fixed(512, 256))
        );
        assert_eq!(ResourceSize::parse("viewport/0"), None);
        assert_eq!(ResourceSize::parse("huge"), None);
    }

    #[test]
    fn test_surface_derived_extent() {
        let surface = Extent::flat(800, 600);
        let half = TextureDecl::new("half", ResourceSize::ViewportDiv(2), PixelFormat::Rgba8Unorm);
        assert!(half.is_surface_derived());
        assert_eq!(half.extent(surface), Extent::flat(400, 300));

        let fixed = TextureDecl::new("lut", ResourceSize::Fixed(64, 64), PixelFormat::Rgba8Unorm)
            .with_dimension(TextureDimension::D3, 64);
        assert!(!fixed.is_surface_derived());
        assert_eq!(fixed.extent(surface), Extent::new(64, 64, 64));

        assert!(TextureDecl::surface_like("scene").is_surface_derived());
    }

    #[test]
    fn test_buffer_sizes() {
        let particles = BufferDecl::new::<[f32; 4]>("particles", ElementCount::Fixed(10));
        assert_eq!(particles.byte_size(Extent::flat(1, 1)), 160);

        let per_pixel = BufferDecl::new::<f32>("depth", ElementCount::PerPixel(1));
        assert!(per_pixel.is_surface_derived());
        assert_eq!(per_pixel.element_count(Extent::flat(4, 3)), 12);
        assert_eq!(per_pixel.byte_size(Extent::flat(4, 3)), 48);

        let empty = BufferDecl::new::<u32>("empty", ElementCount::Fixed(0));
        assert_eq!(empty.byte_size(Extent::default()), 16);
    }

    #[test]
    fn test_handles_are_stable_indices() {
        let mut table = ResourceTable::new();
        let a = table.add_texture(TextureDecl::surface_like("a"));
        let b = table.add_texture(TextureDecl::surface_like("b"));
        let buf = table.buffer::<u32>("counts", 4);
        assert_ne!(a, b);
        assert_eq!(table.texture(b).map(|d| d.name.as_str()), Some("b"));
        assert_eq!(table.buffer_decl(buf).map(|d| d.name.as_str()), Some("counts"));
        assert_eq!(table.textures().count(), 2);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(PixelFormat::from_name("rgba16float"), Ok(PixelFormat::Rgba16Float));
        assert!(PixelFormat::from_name("rgb9e5").is_err());
        assert_eq!(PixelFormat::Rgba8Unorm.storage_name(), Some("rgba8unorm"));
        assert_eq!(PixelFormat::Bgra8UnormSrgb.storage_name(), None);
    }
}
