//! The component tree: what the caller builds to describe a frame.

use std::sync::Arc;

use kiln_core::grid::SizeFn;
use kiln_core::{Argument, BufferHandle, Counter, Extent, Flag, GridSource, TextureHandle, TextureRef};

use crate::async_group::AsyncLink;
use crate::filters::ImageFilter;
use crate::frame::PassInfo;
use crate::gpu::Gpu;
use crate::pass::PassError;

/// A whole frame description: shared helper text plus the root components.
pub struct Program<G: Gpu> {
    /// Emitted untouched after the struct declarations of the main unit.
    pub library: String,
    pub root: Vec<Component<G>>,
}

impl<G: Gpu> Program<G> {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            root: Vec::new(),
        }
    }

    pub fn with(mut self, component: impl Into<Component<G>>) -> Self {
        self.root.push(component.into());
        self
    }

    pub fn push(&mut self, component: impl Into<Component<G>>) {
        self.root.push(component.into());
    }
}

pub enum Component<G: Gpu> {
    Dispatch(Dispatch),
    Draw(Draw),
    Blit(Blit),
    VendorFilter(VendorFilter),
    Group(Group<G>),
    AsyncGroup(AsyncGroup<G>),
    ManualCallback(ManualCallback<G>),
}

impl<G: Gpu> Component<G> {
    pub fn label(&self) -> &str {
        match self {
            Self::Dispatch(d) => &d.label,
            Self::Draw(d) => &d.label,
            Self::Blit(b) => &b.label,
            Self::VendorFilter(f) => &f.label,
            Self::Group(g) => &g.label,
            Self::AsyncGroup(g) => &g.label,
            Self::ManualCallback(c) => &c.label,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A compute kernel launched over a thread grid.
pub struct Dispatch {
    pub(crate) label: String,
    pub(crate) source: String,
    pub(crate) function: String,
    pub(crate) arguments: Vec<Argument>,
    pub(crate) fits: Vec<GridSource>,
    pub(crate) scale: [f32; 3],
    pub(crate) wait_until_completed: bool,
}

impl Dispatch {
    /// `function` is the `@compute` entry point inside `source`.
    pub fn new(function: impl Into<String>, source: impl Into<String>) -> Self {
        let function = function.into();
        Self {
            label: function.clone(),
            source: source.into(),
            function,
            arguments: Vec::new(),
            fits: Vec::new(),
            scale: [1.0; 3],
            wait_until_completed: false,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn arg(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn args(mut self, arguments: impl IntoIterator<Item = Argument>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    pub fn fit_fixed(mut self, extent: impl Into<Extent>) -> Self {
        self.fits.push(GridSource::Fixed(extent.into()));
        self
    }

    /// Grid evaluated every frame.
    pub fn fit_dynamic(
        mut self,
        dims: u8,
        size: impl Fn() -> [u32; 3] + Send + Sync + 'static,
    ) -> Self {
        let size: SizeFn = Arc::new(size);
        self.fits.push(GridSource::Dynamic { dims, size });
        self
    }

    pub fn fit_texture(mut self, argument: impl Into<String>) -> Self {
        self.fits.push(GridSource::Texture(argument.into()));
        self
    }

    pub fn fit_buffer(mut self, argument: impl Into<String>) -> Self {
        self.fits.push(GridSource::Buffer(argument.into()));
        self
    }

    pub fn fit_surface(mut self) -> Self {
        self.fits.push(GridSource::Surface);
        self
    }

    pub fn scale(mut self, scale: [f32; 3]) -> Self {
        self.scale = scale;
        self
    }

    /// Submit the frame so far after this dispatch and block until the GPU
    /// has finished it.
    pub fn wait_until_completed(mut self) -> Self {
        self.wait_until_completed = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Draw
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadAction {
    Clear([f64; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Replace,
    Alpha,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    LineStrip,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub texture: TextureRef,
    pub load: LoadAction,
    pub blend: BlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub texture: TextureHandle,
    /// `None` keeps the previous depth contents.
    pub clear: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexCount {
    Fixed(u32),
    /// One vertex per element of the buffer.
    Buffer(BufferHandle),
}

/// A vertex + fragment program pair drawn into colour targets.
pub struct Draw {
    pub(crate) label: String,
    pub(crate) source: String,
    pub(crate) vertex: String,
    pub(crate) fragment: String,
    pub(crate) vertex_args: Vec<Argument>,
    pub(crate) fragment_args: Vec<Argument>,
    pub(crate) targets: Vec<ColorTarget>,
    pub(crate) depth: Option<DepthTarget>,
    pub(crate) topology: Topology,
    pub(crate) vertices: VertexCount,
    pub(crate) instances: u32,
    pub(crate) index: Option<BufferHandle>,
}

impl Draw {
    pub fn new(
        vertex: impl Into<String>,
        fragment: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let vertex = vertex.into();
        Self {
            label: vertex.clone(),
            source: source.into(),
            vertex,
            fragment: fragment.into(),
            vertex_args: Vec::new(),
            fragment_args: Vec::new(),
            targets: Vec::new(),
            depth: None,
            topology: Topology::TriangleList,
            vertices: VertexCount::Fixed(3),
            instances: 1,
            index: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn vertex_arg(mut self, argument: Argument) -> Self {
        self.vertex_args.push(argument);
        self
    }

    pub fn fragment_arg(mut self, argument: Argument) -> Self {
        self.fragment_args.push(argument);
        self
    }

    pub fn target(mut self, texture: impl Into<TextureRef>, load: LoadAction) -> Self {
        self.targets.push(ColorTarget {
            texture: texture.into(),
            load,
            blend: BlendMode::Replace,
        });
        self
    }

    pub fn blended_target(
        mut self,
        texture: impl Into<TextureRef>,
        load: LoadAction,
        blend: BlendMode,
    ) -> Self {
        self.targets.push(ColorTarget {
            texture: texture.into(),
            load,
            blend,
        });
        self
    }

    pub fn depth(mut self, texture: TextureHandle, clear: Option<f32>) -> Self {
        self.depth = Some(DepthTarget { texture, clear });
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn vertices(mut self, count: u32) -> Self {
        self.vertices = VertexCount::Fixed(count);
        self
    }

    pub fn vertices_from(mut self, buffer: BufferHandle) -> Self {
        self.vertices = VertexCount::Buffer(buffer);
        self
    }

    pub fn instances(mut self, count: u32) -> Self {
        self.instances = count;
        self
    }

    /// Draw indexed; the buffer must hold `u16` or `u32` elements.
    pub fn indexed(mut self, buffer: BufferHandle) -> Self {
        self.index = Some(buffer);
        self
    }
}

// ---------------------------------------------------------------------------
// Blit and filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitOp {
    CopyTexture {
        source: TextureHandle,
        destination: TextureRef,
    },
    CopyBuffer {
        source: BufferHandle,
        destination: BufferHandle,
    },
    ClearBuffer(BufferHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blit {
    pub(crate) label: String,
    pub(crate) op: BlitOp,
}

impl Blit {
    pub fn copy_texture(source: TextureHandle, destination: impl Into<TextureRef>) -> Self {
        Self {
            label: "copy texture".into(),
            op: BlitOp::CopyTexture {
                source,
                destination: destination.into(),
            },
        }
    }

    pub fn copy_buffer(source: BufferHandle, destination: BufferHandle) -> Self {
        Self {
            label: "copy buffer".into(),
            op: BlitOp::CopyBuffer {
                source,
                destination,
            },
        }
    }

    pub fn clear_buffer(buffer: BufferHandle) -> Self {
        Self {
            label: "clear buffer".into(),
            op: BlitOp::ClearBuffer(buffer),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A pre-built image filter from one texture into another.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorFilter {
    pub(crate) label: String,
    pub(crate) filter: ImageFilter,
    pub(crate) source: TextureHandle,
    pub(crate) destination: TextureHandle,
}

impl VendorFilter {
    pub fn new(filter: ImageFilter, source: TextureHandle, destination: TextureHandle) -> Self {
        Self {
            label: filter.name().to_string(),
            filter,
            source,
            destination,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Composites
// ---------------------------------------------------------------------------

/// Ordered children, encoded `repeat` times per frame while `active` holds.
pub struct Group<G: Gpu> {
    pub(crate) label: String,
    pub(crate) children: Vec<Component<G>>,
    pub(crate) repeat: Option<Counter>,
    pub(crate) active: Option<Flag>,
    /// `Some` compiles the children into a private program unit.
    pub(crate) library: Option<String>,
}

impl<G: Gpu> Group<G> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
            repeat: None,
            active: None,
            library: None,
        }
    }

    pub fn child(mut self, component: impl Into<Component<G>>) -> Self {
        self.children.push(component.into());
        self
    }

    pub fn children(mut self, components: impl IntoIterator<Item = Component<G>>) -> Self {
        self.children.extend(components);
        self
    }

    pub fn repeat(mut self, counter: Counter) -> Self {
        self.repeat = Some(counter);
        self
    }

    pub fn active_when(mut self, flag: Flag) -> Self {
        self.active = Some(flag);
        self
    }

    /// Compile the children as a building block with its own program text.
    pub fn isolated(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }
}

/// Children run off-frame by an async coordinator.
pub struct AsyncGroup<G: Gpu> {
    pub(crate) label: String,
    pub(crate) children: Vec<Component<G>>,
    pub(crate) link: Arc<dyn AsyncLink<G>>,
}

impl<G: Gpu> AsyncGroup<G> {
    pub fn new(link: Arc<dyn AsyncLink<G>>) -> Self {
        Self {
            label: link.label().to_string(),
            children: Vec::new(),
            link,
        }
    }

    pub fn child(mut self, component: impl Into<Component<G>>) -> Self {
        self.children.push(component.into());
        self
    }
}

pub type CallbackFn<G> = Box<dyn FnMut(&mut PassInfo<'_, G>) -> Result<(), PassError> + Send>;

/// Caller code run at encode time with full access to the frame.
pub struct ManualCallback<G: Gpu> {
    pub(crate) label: String,
    pub(crate) callback: CallbackFn<G>,
}

impl<G: Gpu> ManualCallback<G> {
    pub fn new(
        label: impl Into<String>,
        callback: impl FnMut(&mut PassInfo<'_, G>) -> Result<(), PassError> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            callback: Box::new(callback),
        }
    }
}

macro_rules! into_component {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(impl<G: Gpu> From<$ty> for Component<G> {
            fn from(value: $ty) -> Self {
                Self::$variant(value)
            }
        })*
    };
}

into_component!(
    Dispatch => Dispatch,
    Draw => Draw,
    Blit => Blit,
    VendorFilter => VendorFilter,
);

impl<G: Gpu> From<Group<G>> for Component<G> {
    fn from(value: Group<G>) -> Self {
        Self::Group(value)
    }
}

impl<G: Gpu> From<AsyncGroup<G>> for Component<G> {
    fn from(value: AsyncGroup<G>) -> Self {
        Self::AsyncGroup(value)
    }
}

impl<G: Gpu> From<ManualCallback<G>> for Component<G> {
    fn from(value: ManualCallback<G>) -> Self {
        Self::ManualCallback(value)
    }
}
