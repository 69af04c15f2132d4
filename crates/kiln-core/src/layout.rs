//! GPU data layouts for host values bound to generated programs.
//!
//! Native record types describe their own GPU layout by implementing
//! [`GpuLayout`], normally through the [`gpu_struct!`](crate::gpu_struct)
//! macro. The compiler turns those descriptions into WGSL type names and
//! struct declarations collected in a per-compile [`SymbolTable`].

use indexmap::IndexMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("struct `{name}` is declared twice with different layouts")]
    Conflict { name: String },
    #[error("field `{structure}.{field}` sits at native offset {native} but WGSL places it at {gpu}")]
    FieldOffset {
        structure: String,
        field: String,
        native: usize,
        gpu: usize,
    },
    #[error("struct `{structure}` is {native} bytes natively but {gpu} bytes in WGSL")]
    Size {
        structure: String,
        native: usize,
        gpu: usize,
    },
    #[error("type `{ty}` cannot be used inside a shader program")]
    Unsupported { ty: String },
}

// ---------------------------------------------------------------------------
// Type model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    I32,
    U32,
    /// Only valid as an index-buffer element; WGSL has no 16-bit integers.
    U16,
}

impl ScalarType {
    pub fn wgsl_name(self) -> Option<&'static str> {
        match self {
            Self::F32 => Some("f32"),
            Self::I32 => Some("i32"),
            Self::U32 => Some("u32"),
            Self::U16 => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::U16 => 2,
            _ => 4,
        }
    }
}

/// The GPU-side shape of a host value.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuType {
    Scalar(ScalarType),
    Vector(ScalarType, u8),
    /// Column-major `f32` matrix.
    Matrix { columns: u8, rows: u8 },
    Array(Box<GpuType>, usize),
    Struct(StructDecl),
    /// Caller-supplied type name, emitted verbatim and never synthesized.
    Named(String),
}

impl GpuType {
    /// WGSL spelling of this type.
    pub fn wgsl_name(&self) -> Result<String, LayoutError> {
        match self {
            Self::Scalar(s) => s
                .wgsl_name()
                .map(str::to_string)
                .ok_or_else(|| self.unsupported()),
            Self::Vector(s, n) => {
                let scalar = s.wgsl_name().ok_or_else(|| self.unsupported())?;
                Ok(format!("vec{n}<{scalar}>"))
            }
            Self::Matrix { columns, rows } => Ok(format!("mat{columns}x{rows}<f32>")),
            Self::Array(inner, n) => Ok(format!("array<{}, {n}>", inner.wgsl_name()?)),
            Self::Struct(decl) => Ok(decl.name.clone()),
            Self::Named(name) => Ok(name.clone()),
        }
    }

    /// WGSL `(align, size)` of this type, `None` for opaque named types.
    pub fn wgsl_layout(&self) -> Option<(usize, usize)> {
        match self {
            Self::Scalar(s) => Some((s.size(), s.size())),
            Self::Vector(s, n) => {
                let size = s.size() * *n as usize;
                let align = if *n == 2 { size } else { s.size() * 4 };
                Some((align, size))
            }
            Self::Matrix { columns, rows } => {
                let (col_align, col_size) = Self::Vector(ScalarType::F32, *rows).wgsl_layout()?;
                Some((col_align, *columns as usize * round_up(col_align, col_size)))
            }
            Self::Array(inner, n) => {
                let (align, size) = inner.wgsl_layout()?;
                Some((align, n * round_up(align, size)))
            }
            Self::Struct(decl) => decl.wgsl_layout(),
            Self::Named(_) => None,
        }
    }

    pub fn is_scalar(&self, scalar: ScalarType) -> bool {
        matches!(self, Self::Scalar(s) if *s == scalar)
    }

    fn unsupported(&self) -> LayoutError {
        LayoutError::Unsupported {
            ty: format!("{self:?}"),
        }
    }
}

pub(crate) fn round_up(align: usize, value: usize) -> usize {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: GpuType,
    /// Byte offset of the field in the native record.
    pub native_offset: usize,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, ty: GpuType, native_offset: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            native_offset,
        }
    }

    /// Describe a field through an accessor so the field type is inferred.
    pub fn of<S, F: GpuLayout>(
        name: &str,
        native_offset: usize,
        _accessor: impl Fn(&S) -> &F,
    ) -> Self {
        Self::new(name, F::gpu_type(), native_offset)
    }
}

/// A synthesized WGSL struct declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub native_size: usize,
}

impl StructDecl {
    pub fn new(name: impl Into<String>, native_size: usize, fields: Vec<FieldDecl>) -> Self {
        Self {
            name: name.into(),
            fields,
            native_size,
        }
    }

    /// WGSL offsets of each field, `None` if any field is opaque.
    pub fn wgsl_offsets(&self) -> Option<Vec<usize>> {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut cursor = 0;
        for field in &self.fields {
            let (align, size) = field.ty.wgsl_layout()?;
            let offset = round_up(align, cursor);
            offsets.push(offset);
            cursor = offset + size;
        }
        Some(offsets)
    }

    pub fn wgsl_layout(&self) -> Option<(usize, usize)> {
        let offsets = self.wgsl_offsets()?;
        let mut align = 1;
        let mut end = 0;
        for (field, offset) in self.fields.iter().zip(&offsets) {
            let (field_align, field_size) = field.ty.wgsl_layout()?;
            align = align.max(field_align);
            end = offset + field_size;
        }
        Some((align, round_up(align, end)))
    }

    /// Check that the native record matches the WGSL layout byte for byte.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let Some(offsets) = self.wgsl_offsets() else {
            return Ok(());
        };
        for (field, gpu) in self.fields.iter().zip(offsets) {
            if field.native_offset != gpu {
                return Err(LayoutError::FieldOffset {
                    structure: self.name.clone(),
                    field: field.name.clone(),
                    native: field.native_offset,
                    gpu,
                });
            }
        }
        if let Some((_, gpu_size)) = self.wgsl_layout() {
            if gpu_size != self.native_size {
                return Err(LayoutError::Size {
                    structure: self.name.clone(),
                    native: self.native_size,
                    gpu: gpu_size,
                });
            }
        }
        Ok(())
    }

    pub fn declaration(&self) -> Result<String, LayoutError> {
        let mut out = format!("struct {} {{\n", self.name);
        for field in &self.fields {
            out.push_str(&format!("    {}: {},\n", field.name, field.ty.wgsl_name()?));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Native type description
// ---------------------------------------------------------------------------

/// Implemented by host types that can be passed to a generated program.
pub trait GpuLayout {
    fn gpu_type() -> GpuType;
}

macro_rules! impl_scalar {
    ($($ty:ty => $scalar:ident),* $(,)?) => {
        $(impl GpuLayout for $ty {
            fn gpu_type() -> GpuType {
                GpuType::Scalar(ScalarType::$scalar)
            }
        })*
    };
}

impl_scalar!(f32 => F32, i32 => I32, u32 => U32, u16 => U16);

impl<T: GpuLayout, const N: usize> GpuLayout for [T; N] {
    fn gpu_type() -> GpuType {
        match T::gpu_type() {
            GpuType::Scalar(s) if (2..=4).contains(&N) && s != ScalarType::U16 => {
                GpuType::Vector(s, N as u8)
            }
            inner => GpuType::Array(Box::new(inner), N),
        }
    }
}

macro_rules! impl_glam {
    ($($ty:ty => $expr:expr),* $(,)?) => {
        $(impl GpuLayout for $ty {
            fn gpu_type() -> GpuType {
                $expr
            }
        })*
    };
}

impl_glam!(
    glam::Vec2 => GpuType::Vector(ScalarType::F32, 2),
    glam::Vec3 => GpuType::Vector(ScalarType::F32, 3),
    glam::Vec4 => GpuType::Vector(ScalarType::F32, 4),
    glam::UVec2 => GpuType::Vector(ScalarType::U32, 2),
    glam::UVec3 => GpuType::Vector(ScalarType::U32, 3),
    glam::UVec4 => GpuType::Vector(ScalarType::U32, 4),
    glam::IVec2 => GpuType::Vector(ScalarType::I32, 2),
    glam::IVec3 => GpuType::Vector(ScalarType::I32, 3),
    glam::IVec4 => GpuType::Vector(ScalarType::I32, 4),
    glam::Mat2 => GpuType::Matrix { columns: 2, rows: 2 },
    glam::Mat4 => GpuType::Matrix { columns: 4, rows: 4 },
);

/// Implement [`GpuLayout`] for a `#[repr(C)]` struct, field by field.
///
/// ```
/// #[repr(C)]
/// #[derive(Clone, Copy)]
/// struct Particle {
///     position: [f32; 2],
///     velocity: [f32; 2],
/// }
/// kiln_core::gpu_struct!(Particle { position, velocity });
/// ```
#[macro_export]
macro_rules! gpu_struct {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::layout::GpuLayout for $ty {
            fn gpu_type() -> $crate::layout::GpuType {
                $crate::layout::GpuType::Struct($crate::layout::StructDecl::new(
                    stringify!($ty),
                    ::core::mem::size_of::<$ty>(),
                    vec![$(
                        $crate::layout::FieldDecl::of(
                            stringify!($field),
                            ::core::mem::offset_of!($ty, $field),
                            |value: &$ty| &value.$field,
                        )
                    ),+],
                ))
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

/// Struct declarations of one program unit, in dependency order.
///
/// Scoped to a single compile so repeated compiles never see each other's
/// declarations.
#[derive(Debug, Default)]
pub struct SymbolTable {
    structs: IndexMap<String, StructDecl>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every struct reachable from `ty`, nested structs first.
    pub fn declare(&mut self, ty: &GpuType) -> Result<(), LayoutError> {
        match ty {
            GpuType::Array(inner, _) => self.declare(inner),
            GpuType::Struct(decl) => {
                for field in &decl.fields {
                    self.declare(&field.ty)?;
                }
                match self.structs.get(&decl.name) {
                    Some(existing) if existing == decl => Ok(()),
                    Some(_) => Err(LayoutError::Conflict {
                        name: decl.name.clone(),
                    }),
                    None => {
                        decl.validate()?;
                        tracing::trace!("declared struct {}", decl.name);
                        self.structs.insert(decl.name.clone(), decl.clone());
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.structs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructDecl> {
        self.structs.values()
    }

    /// All declarations as WGSL text.
    pub fn declarations(&self) -> Result<String, LayoutError> {
        let mut out = String::new();
        for decl in self.structs.values() {
            out.push_str(&decl.declaration()?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Light {
        position: [f32; 3],
        intensity: f32,
        color: [f32; 4],
    }
    crate::gpu_struct!(Light { position, intensity, color });

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Scene {
        lights: [Light; 2],
        count: u32,
        _pad0: u32,
        _pad1: u32,
        _pad2: u32,
    }
    crate::gpu_struct!(Scene { lights, count, _pad0, _pad1, _pad2 });

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Misaligned {
        a: f32,
        b: [f32; 4],
    }
    crate::gpu_struct!(Misaligned { a, b });

    #[test]
    fn test_scalar_and_vector_names() {
        assert_eq!(f32::gpu_type().wgsl_name().unwrap(), "f32");
        assert_eq!(<[u32; 2]>::gpu_type().wgsl_name().unwrap(), "vec2<u32>");
        assert_eq!(<[f32; 8]>::gpu_type().wgsl_name().unwrap(), "array<f32, 8>");
        assert_eq!(glam::Mat4::gpu_type().wgsl_name().unwrap(), "mat4x4<f32>");
        assert_eq!(
            <[[f32; 4]; 4]>::gpu_type().wgsl_name().unwrap(),
            "array<vec4<f32>, 4>"
        );
        assert!(u16::gpu_type().wgsl_name().is_err());
    }

    #[test]
    fn test_wgsl_layout_rules() {
        assert_eq!(<[f32; 3]>::gpu_type().wgsl_layout(), Some((16, 12)));
        assert_eq!(<[f32; 2]>::gpu_type().wgsl_layout(), Some((8, 8)));
        assert_eq!(glam::Mat4::gpu_type().wgsl_layout(), Some((16, 64)));
        assert_eq!(Light::gpu_type().wgsl_layout(), Some((16, 32)));
        assert_eq!(Scene::gpu_type().wgsl_layout(), Some((16, 80)));
    }

    #[test]
    fn test_struct_declaration_text() {
        let GpuType::Struct(decl) = Light::gpu_type() else {
            panic!("expected struct");
        };
        let text = decl.declaration().unwrap();
        assert_eq!(
            text,
            "struct Light {\n    position: vec3<f32>,\n    intensity: f32,\n    color: vec4<f32>,\n}\n"
        );
    }

    #[test]
    fn test_nested_structs_declared_first_and_once() {
        let mut table = SymbolTable::new();
        table.declare(&Scene::gpu_type()).unwrap();
        table.declare(&Light::gpu_type()).unwrap();
        table.declare(&Scene::gpu_type()).unwrap();

        let names: Vec<_> = table.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Light", "Scene"]);
        let text = table.declarations().unwrap();
        assert_eq!(text.matches("struct Light {").count(), 1);
        assert!(text.find("struct Light").unwrap() < text.find("struct Scene").unwrap());
    }

    #[test]
    fn test_conflicting_struct_rejected() {
        let mut table = SymbolTable::new();
        table.declare(&Light::gpu_type()).unwrap();
        let imposter = GpuType::Struct(StructDecl::new(
            "Light",
            4,
            vec![FieldDecl::new("only", GpuType::Scalar(ScalarType::F32), 0)],
        ));
        assert_eq!(
            table.declare(&imposter),
            Err(LayoutError::Conflict {
                name: "Light".to_string()
            })
        );
    }

    #[test]
    fn test_misaligned_native_layout_detected() {
        let mut table = SymbolTable::new();
        match table.declare(&Misaligned::gpu_type()) {
            Err(LayoutError::FieldOffset { field, native, gpu, .. }) => {
                assert_eq!(field, "b");
                assert_eq!(native, 4);
                assert_eq!(gpu, 16);
            }
            other => panic!("expected FieldOffset, got {other:?}"),
        }
    }
}
