//! Thread-grid fitting for compute dispatches.
//!
//! A dispatch names one [`GridSource`]; [`resolve`] turns it into a
//! [`GridPlan`] with a fixed dimensionality, a workgroup size and the
//! decision whether the kernel needs a bounds-check prologue. The extent is
//! recomputed from the plan every frame since most sources track resources
//! that can be resized.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::argument::{Argument, ArgumentKind};
use crate::resource::{BufferHandle, Extent, ResourceTable, TextureDimension, TextureHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCaps {
    /// The device can launch a grid that is not a multiple of the workgroup.
    pub non_uniform_dispatch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("`{function}` has no grid fit")]
    Missing { function: String },
    #[error("`{function}` sets its grid fit more than once")]
    Duplicate { function: String },
    #[error("grid fit of `{function}` names `{argument}`, which is not a {expected} argument")]
    UnknownArgument {
        function: String,
        argument: String,
        expected: &'static str,
    },
    #[error("dynamic grid of `{function}` must have 1 to 3 dimensions, got {dims}")]
    BadDimensions { function: String, dims: u8 },
    #[error("grid scale of `{function}` must be positive and finite")]
    BadScale { function: String },
}

pub type SizeFn = Arc<dyn Fn() -> [u32; 3] + Send + Sync>;

/// Where a dispatch takes its grid extent from.
#[derive(Clone)]
pub enum GridSource {
    Fixed(Extent),
    /// Evaluated every frame.
    Dynamic { dims: u8, size: SizeFn },
    /// Extent of the texture bound to the named argument.
    Texture(String),
    /// Element count of the buffer bound to the named argument.
    Buffer(String),
    Surface,
}

impl fmt::Debug for GridSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(extent) => f.debug_tuple("Fixed").field(extent).finish(),
            Self::Dynamic { dims, .. } => f.debug_struct("Dynamic").field("dims", dims).finish(),
            Self::Texture(arg) => f.debug_tuple("Texture").field(arg).finish(),
            Self::Buffer(arg) => f.debug_tuple("Buffer").field(arg).finish(),
            Self::Surface => f.write_str("Surface"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridDims {
    One,
    Two,
    Three,
}

impl GridDims {
    pub fn from_count(count: u8) -> Option<Self> {
        match count {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }

    pub fn count(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// WGSL type of the grid extent uniform.
    pub fn wgsl_type(self) -> &'static str {
        match self {
            Self::One => "u32",
            Self::Two => "vec2<u32>",
            Self::Three => "vec3<u32>",
        }
    }

    pub fn default_workgroup(self) -> [u32; 3] {
        match self {
            Self::One => [64, 1, 1],
            Self::Two => [8, 8, 1],
            Self::Three => [4, 4, 4],
        }
    }

    fn of_extent(extent: Extent) -> Self {
        if extent.depth > 1 {
            Self::Three
        } else if extent.height > 1 {
            Self::Two
        } else {
            Self::One
        }
    }
}

/// Grid source with argument names resolved to resource handles.
#[derive(Clone)]
pub enum PlannedSource {
    Fixed(Extent),
    Dynamic(SizeFn),
    Texture(TextureHandle),
    Buffer(BufferHandle),
    Surface,
}

impl fmt::Debug for PlannedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(extent) => f.debug_tuple("Fixed").field(extent).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic"),
            Self::Texture(h) => f.debug_tuple("Texture").field(h).finish(),
            Self::Buffer(h) => f.debug_tuple("Buffer").field(h).finish(),
            Self::Surface => f.write_str("Surface"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridPlan {
    pub dims: GridDims,
    pub source: PlannedSource,
    pub scale: [f32; 3],
    pub workgroup: [u32; 3],
    /// The kernel starts with an out-of-range early return.
    pub bounds_check: bool,
    /// The driver launches exact thread counts instead of workgroup counts.
    pub exact_threads: bool,
}

impl GridPlan {
    /// Apply the axis scale to a source extent, rounding up, and clear the
    /// axes beyond the grid's dimensionality.
    pub fn extent(&self, source: Extent) -> [u32; 3] {
        let axes = source.axes();
        let mut out = [1; 3];
        for axis in 0..3 {
            if axis < self.dims.count() {
                out[axis] = scale_axis(axes[axis], self.scale[axis]);
            }
        }
        out
    }

    /// Workgroups needed to cover `grid`.
    pub fn workgroups(&self, grid: [u32; 3]) -> [u32; 3] {
        [
            grid[0].div_ceil(self.workgroup[0].max(1)),
            grid[1].div_ceil(self.workgroup[1].max(1)),
            grid[2].div_ceil(self.workgroup[2].max(1)),
        ]
    }

    /// Bytes of the grid extent uniform for `grid`, padded to 16.
    pub fn extent_bytes(&self, grid: [u32; 3]) -> Vec<u8> {
        let words = [grid[0], grid[1], grid[2], 0];
        bytemuck::cast_slice(&words).to_vec()
    }
}

pub fn scale_axis(value: u32, scale: f32) -> u32 {
    (value as f64 * scale as f64).ceil() as u32
}

/// Resolve the grid fits declared on `function` into a plan.
///
/// `fits` is every fit the caller set; more than one is an error.
pub fn resolve(
    function: &str,
    fits: &[GridSource],
    scale: [f32; 3],
    arguments: &[Argument],
    table: &ResourceTable,
    caps: DeviceCaps,
) -> Result<GridPlan, GridError> {
    let fit = match fits {
        [] => {
            return Err(GridError::Missing {
                function: function.to_string(),
            })
        }
        [fit] => fit,
        _ => {
            return Err(GridError::Duplicate {
                function: function.to_string(),
            })
        }
    };
    if scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(GridError::BadScale {
            function: function.to_string(),
        });
    }

    let (dims, source) = match fit {
        GridSource::Fixed(extent) => (GridDims::of_extent(*extent), PlannedSource::Fixed(*extent)),
        GridSource::Dynamic { dims, size } => {
            let dims = GridDims::from_count(*dims).ok_or_else(|| GridError::BadDimensions {
                function: function.to_string(),
                dims: *dims,
            })?;
            (dims, PlannedSource::Dynamic(Arc::clone(size)))
        }
        GridSource::Texture(name) => {
            let texture = find_argument(arguments, name, |kind| match kind {
                ArgumentKind::Texture { texture, .. } => Some(*texture),
                _ => None,
            })
            .ok_or_else(|| GridError::UnknownArgument {
                function: function.to_string(),
                argument: name.clone(),
                expected: "texture",
            })?;
            let dims = match table.texture(texture).map(|d| d.dimension) {
                Some(TextureDimension::D1) => GridDims::One,
                Some(TextureDimension::D3) => GridDims::Three,
                _ => GridDims::Two,
            };
            (dims, PlannedSource::Texture(texture))
        }
        GridSource::Buffer(name) => {
            let buffer = find_argument(arguments, name, |kind| match kind {
                ArgumentKind::Buffer { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .ok_or_else(|| GridError::UnknownArgument {
                function: function.to_string(),
                argument: name.clone(),
                expected: "buffer",
            })?;
            let dims = if scale[2] > 1.0 {
                GridDims::Three
            } else if scale[1] > 1.0 {
                GridDims::Two
            } else {
                GridDims::One
            };
            (dims, PlannedSource::Buffer(buffer))
        }
        GridSource::Surface => (GridDims::Two, PlannedSource::Surface),
    };

    Ok(GridPlan {
        dims,
        source,
        scale,
        workgroup: dims.default_workgroup(),
        bounds_check: !caps.non_uniform_dispatch,
        exact_threads: caps.non_uniform_dispatch,
    })
}

fn find_argument<T>(
    arguments: &[Argument],
    name: &str,
    pick: impl Fn(&ArgumentKind) -> Option<T>,
) -> Option<T> {
    arguments
        .iter()
        .find(|a| a.name == name)
        .and_then(|a| pick(&a.kind))
}

/// Out-of-range early return for a kernel using `gid` and `grid`.
pub fn bounds_check(dims: GridDims, gid: &str, grid: &str) -> String {
    let condition = match dims {
        GridDims::One => format!("{gid}.x >= {grid}"),
        GridDims::Two => format!("{gid}.x >= {grid}.x || {gid}.y >= {grid}.y"),
        GridDims::Three => {
            format!("{gid}.x >= {grid}.x || {gid}.y >= {grid}.y || {gid}.z >= {grid}.z")
        }
    };
    format!("\n    if ({condition}) {{ return; }}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PixelFormat, ResourceSize, TextureDecl};

    fn caps(non_uniform: bool) -> DeviceCaps {
        DeviceCaps {
            non_uniform_dispatch: non_uniform,
        }
    }

    #[test]
    fn test_missing_and_duplicate_fits() {
        let table = ResourceTable::new();
        let err = resolve("k", &[], [1.0; 3], &[], &table, caps(false)).unwrap_err();
        assert!(matches!(err, GridError::Missing { .. }));

        let fits = [GridSource::Surface, GridSource::Fixed(Extent::from(16))];
        let err = resolve("k", &fits, [1.0; 3], &[], &table, caps(false)).unwrap_err();
        assert!(matches!(err, GridError::Duplicate { .. }));
    }

    #[test]
    fn test_texture_array_reduces_to_2d() {
        let mut table = ResourceTable::new();
        let layers = table.add_texture(
            TextureDecl::new("layers", ResourceSize::Fixed(32, 32), PixelFormat::Rgba8Unorm)
                .with_dimension(TextureDimension::D2Array, 4),
        );
        let volume = table.add_texture(
            TextureDecl::new("volume", ResourceSize::Fixed(8, 8), PixelFormat::R32Float)
                .with_dimension(TextureDimension::D3, 8),
        );
        let args = [
            Argument::texture("layers", layers),
            Argument::write_texture("volume", volume),
        ];
        let plan = resolve(
            "k",
            &[GridSource::Texture("layers".into())],
            [1.0; 3],
            &args,
            &table,
            caps(false),
        )
        .unwrap();
        assert_eq!(plan.dims, GridDims::Two);
        assert_eq!(plan.extent(Extent::new(32, 32, 4)), [32, 32, 1]);

        let plan = resolve(
            "k",
            &[GridSource::Texture("volume".into())],
            [1.0; 3],
            &args,
            &table,
            caps(false),
        )
        .unwrap();
        assert_eq!(plan.dims, GridDims::Three);
        assert_eq!(plan.workgroup, [4, 4, 4]);
    }

    #[test]
    fn test_buffer_grid_grows_with_scale() {
        let mut table = ResourceTable::new();
        let buf = table.buffer::<f32>("values", 100);
        let args = [Argument::buffer("values", buf)];
        let fits = [GridSource::Buffer("values".into())];

        let plan = resolve("k", &fits, [1.0; 3], &args, &table, caps(false)).unwrap();
        assert_eq!(plan.dims, GridDims::One);
        assert_eq!(plan.extent(Extent::from(100)), [100, 1, 1]);

        let plan = resolve("k", &fits, [0.5, 3.0, 1.0], &args, &table, caps(false)).unwrap();
        assert_eq!(plan.dims, GridDims::Two);
        assert_eq!(plan.extent(Extent::from(101)), [51, 3, 1]);
    }

    #[test]
    fn test_buffer_fit_requires_buffer_argument() {
        let mut table = ResourceTable::new();
        let tex = table.add_texture(TextureDecl::surface_like("color"));
        let args = [Argument::texture("color", tex)];
        let err = resolve(
            "k",
            &[GridSource::Buffer("color".into())],
            [1.0; 3],
            &args,
            &table,
            caps(false),
        )
        .unwrap_err();
        assert!(matches!(err, GridError::UnknownArgument { expected: "buffer", .. }));
    }

    #[test]
    fn test_uniform_dispatch_rounds_up_workgroups() {
        let table = ResourceTable::new();
        let plan = resolve("k", &[GridSource::Surface], [1.0; 3], &[], &table, caps(false)).unwrap();
        assert!(plan.bounds_check);
        assert!(!plan.exact_threads);
        let grid = plan.extent(Extent::flat(100, 30));
        assert_eq!(plan.workgroups(grid), [13, 4, 1]);

        let plan = resolve("k", &[GridSource::Surface], [1.0; 3], &[], &table, caps(true)).unwrap();
        assert!(!plan.bounds_check);
        assert!(plan.exact_threads);
    }

    #[test]
    fn test_bounds_check_text() {
        assert_eq!(
            bounds_check(GridDims::Two, "gid", "grid_size"),
            "\n    if (gid.x >= grid_size.x || gid.y >= grid_size.y) { return; }"
        );
        assert!(bounds_check(GridDims::One, "gid", "n").contains("gid.x >= n)"));
    }
}
