//! Materialized GPU resources, indexed by the caller's handles.
//!
//! Only resources the compiled program actually touches are created. Each
//! slot carries a generation that bumps whenever the allocation is replaced,
//! which is how bind groups notice they went stale.

use kiln_core::{
    BufferHandle, BufferUsage, Extent, PixelFormat, ResourceTable, TextureHandle, TextureUsage,
};

use crate::compiler::ResourceUsage;
use crate::frame::SurfaceInfo;
use crate::gpu::{BufferSpec, Gpu, GpuError, TextureSpec};

struct TextureSlot<T> {
    texture: T,
    extent: Extent,
    format: PixelFormat,
    generation: u64,
}

struct BufferSlot<B> {
    buffer: B,
    size: u64,
    elements: u64,
    generation: u64,
}

pub struct ResourcePool<G: Gpu> {
    table: ResourceTable,
    usage: ResourceUsage,
    textures: Vec<Option<TextureSlot<G::Texture>>>,
    buffers: Vec<Option<BufferSlot<G::Buffer>>>,
    surface: Option<SurfaceInfo>,
}

impl<G: Gpu> ResourcePool<G> {
    pub fn new(table: ResourceTable, usage: ResourceUsage) -> Self {
        Self {
            textures: (0..table.texture_count()).map(|_| None).collect(),
            buffers: (0..table.buffer_count()).map(|_| None).collect(),
            table,
            usage,
            surface: None,
        }
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// Create every used resource that does not exist yet.
    pub fn materialize(&mut self, gpu: &G, surface: SurfaceInfo) -> Result<usize, GpuError> {
        let mut created = 0;
        for (handle, usage) in self.usage.textures.clone() {
            if self.textures.get(handle.index()).is_some_and(Option::is_some) {
                continue;
            }
            self.create_texture(gpu, handle, usage, surface, 0)?;
            created += 1;
        }
        for (handle, usage) in self.usage.buffers.clone() {
            if self.buffers.get(handle.index()).is_some_and(Option::is_some) {
                continue;
            }
            self.create_buffer(gpu, handle, usage, surface, 0)?;
            created += 1;
        }
        self.surface = Some(surface);
        tracing::debug!("materialized {created} resources");
        Ok(created)
    }

    /// Recreate surface-derived resources whose size or format changed.
    /// Returns how many were replaced. The new surface is only recorded once
    /// every recreation succeeded, so a failed resize is retried in full.
    pub fn resize(&mut self, gpu: &G, surface: SurfaceInfo) -> Result<usize, GpuError> {
        if self.surface == Some(surface) {
            return Ok(0);
        }
        let mut replaced = 0;

        for (handle, usage) in self.usage.textures.clone() {
            let Some(decl) = self.table.texture(handle) else {
                continue;
            };
            if !decl.is_surface_derived() {
                continue;
            }
            let extent = decl.extent(surface.extent);
            let format = decl.format.resolve(surface.format);
            let generation = match &self.textures[handle.index()] {
                Some(slot) if slot.extent == extent && slot.format == format => continue,
                Some(slot) => slot.generation + 1,
                None => 0,
            };
            self.create_texture(gpu, handle, usage, surface, generation)?;
            replaced += 1;
        }

        for (handle, usage) in self.usage.buffers.clone() {
            let Some(decl) = self.table.buffer_decl(handle) else {
                continue;
            };
            if !decl.is_surface_derived() {
                continue;
            }
            let size = decl.byte_size(surface.extent);
            let generation = match &self.buffers[handle.index()] {
                Some(slot) if slot.size == size => continue,
                Some(slot) => slot.generation + 1,
                None => 0,
            };
            self.create_buffer(gpu, handle, usage, surface, generation)?;
            replaced += 1;
        }

        self.surface = Some(surface);
        if replaced > 0 {
            tracing::debug!(
                "resize to {}x{}: recreated {replaced} resources",
                surface.extent.width,
                surface.extent.height
            );
        }
        Ok(replaced)
    }

    fn create_texture(
        &mut self,
        gpu: &G,
        handle: TextureHandle,
        usage: TextureUsage,
        surface: SurfaceInfo,
        generation: u64,
    ) -> Result<(), GpuError> {
        let decl = self
            .table
            .texture(handle)
            .ok_or_else(|| GpuError::creation(handle.to_string(), "not declared"))?;
        let extent = decl.extent(surface.extent);
        let format = decl.format.resolve(surface.format);
        let texture = gpu.create_texture(&TextureSpec {
            label: decl.name.clone(),
            extent,
            dimension: decl.dimension,
            format,
            usage,
        })?;
        tracing::debug!(
            "texture '{}' {}x{}x{} {format:?} (generation {generation})",
            decl.name,
            extent.width,
            extent.height,
            extent.depth
        );
        self.textures[handle.index()] = Some(TextureSlot {
            texture,
            extent,
            format,
            generation,
        });
        Ok(())
    }

    fn create_buffer(
        &mut self,
        gpu: &G,
        handle: BufferHandle,
        usage: BufferUsage,
        surface: SurfaceInfo,
        generation: u64,
    ) -> Result<(), GpuError> {
        let decl = self
            .table
            .buffer_decl(handle)
            .ok_or_else(|| GpuError::creation(handle.to_string(), "not declared"))?;
        let size = decl.byte_size(surface.extent);
        let buffer = gpu.create_buffer(&BufferSpec {
            label: decl.name.clone(),
            size,
            usage: usage | BufferUsage::COPY_DST,
        })?;
        tracing::debug!("buffer '{}' {size} bytes (generation {generation})", decl.name);
        self.buffers[handle.index()] = Some(BufferSlot {
            buffer,
            size,
            elements: decl.element_count(surface.extent),
            generation,
        });
        Ok(())
    }

    // -- access ---------------------------------------------------------------

    pub fn surface(&self) -> Option<SurfaceInfo> {
        self.surface
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&G::Texture> {
        self.texture_slot(handle).map(|slot| &slot.texture)
    }

    pub fn texture_extent(&self, handle: TextureHandle) -> Option<Extent> {
        self.texture_slot(handle).map(|slot| slot.extent)
    }

    pub fn texture_format(&self, handle: TextureHandle) -> Option<PixelFormat> {
        self.texture_slot(handle).map(|slot| slot.format)
    }

    pub fn texture_generation(&self, handle: TextureHandle) -> Option<u64> {
        self.texture_slot(handle).map(|slot| slot.generation)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&G::Buffer> {
        self.buffer_slot(handle).map(|slot| &slot.buffer)
    }

    /// Element count of a buffer.
    pub fn buffer_len(&self, handle: BufferHandle) -> Option<u64> {
        self.buffer_slot(handle).map(|slot| slot.elements)
    }

    /// Allocation size in bytes.
    pub fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffer_slot(handle).map(|slot| slot.size)
    }

    pub fn buffer_generation(&self, handle: BufferHandle) -> Option<u64> {
        self.buffer_slot(handle).map(|slot| slot.generation)
    }

    fn texture_slot(&self, handle: TextureHandle) -> Option<&TextureSlot<G::Texture>> {
        self.textures.get(handle.index()).and_then(Option::as_ref)
    }

    fn buffer_slot(&self, handle: BufferHandle) -> Option<&BufferSlot<G::Buffer>> {
        self.buffers.get(handle.index()).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingGpu;
    use kiln_core::{ElementCount, ResourceSize, TextureDecl};

    fn surface(width: u32, height: u32) -> SurfaceInfo {
        SurfaceInfo {
            extent: Extent::flat(width, height),
            format: PixelFormat::Bgra8UnormSrgb,
        }
    }

    struct Fixture {
        pool: ResourcePool<RecordingGpu>,
        fixed: TextureHandle,
        scaled: TextureHandle,
        points: BufferHandle,
        per_pixel: BufferHandle,
    }

    fn fixture() -> Fixture {
        let mut table = ResourceTable::new();
        let fixed = table.add_texture(TextureDecl::new(
            "lut",
            ResourceSize::Fixed(64, 64),
            PixelFormat::Rgba8Unorm,
        ));
        let scaled = table.add_texture(TextureDecl::new(
            "half",
            ResourceSize::ViewportDiv(2),
            PixelFormat::Rgba16Float,
        ));
        table.add_texture(TextureDecl::surface_like("unused"));
        let points = table.buffer::<[f32; 4]>("points", 100);
        let per_pixel = table.add_buffer(kiln_core::BufferDecl::new::<u32>(
            "ids",
            ElementCount::PerPixel(1),
        ));

        let mut usage = ResourceUsage::default();
        usage.textures.insert(fixed, TextureUsage::SAMPLED);
        usage.textures.insert(scaled, TextureUsage::STORAGE);
        usage.buffers.insert(points, BufferUsage::STORAGE);
        usage.buffers.insert(per_pixel, BufferUsage::STORAGE);

        Fixture {
            pool: ResourcePool::new(table, usage),
            fixed,
            scaled,
            points,
            per_pixel,
        }
    }

    #[test]
    fn test_materialize_creates_only_used_resources() {
        let gpu = RecordingGpu::default();
        let mut f = fixture();
        assert_eq!(f.pool.materialize(&gpu, surface(640, 480)).unwrap(), 4);
        assert_eq!(gpu.textures_created().len(), 2);
        assert_eq!(f.pool.texture_extent(f.scaled), Some(Extent::flat(320, 240)));
        assert_eq!(f.pool.buffer_len(f.per_pixel), Some(640 * 480));
        assert_eq!(f.pool.buffer_size(f.points), Some(1600));

        // A second call is a no-op.
        assert_eq!(f.pool.materialize(&gpu, surface(640, 480)).unwrap(), 0);
    }

    #[test]
    fn test_resize_replaces_only_surface_derived() {
        let gpu = RecordingGpu::default();
        let mut f = fixture();
        f.pool.materialize(&gpu, surface(640, 480)).unwrap();
        let fixed_id = f.pool.texture(f.fixed).unwrap().id;
        let scaled_id = f.pool.texture(f.scaled).unwrap().id;
        let points_id = f.pool.buffer(f.points).unwrap().id;
        let pixels_id = f.pool.buffer(f.per_pixel).unwrap().id;

        assert_eq!(f.pool.resize(&gpu, surface(800, 600)).unwrap(), 2);

        assert_eq!(f.pool.texture(f.fixed).unwrap().id, fixed_id);
        assert_eq!(f.pool.texture_generation(f.fixed), Some(0));
        assert_eq!(f.pool.buffer(f.points).unwrap().id, points_id);
        assert_eq!(f.pool.buffer_generation(f.points), Some(0));

        assert_ne!(f.pool.texture(f.scaled).unwrap().id, scaled_id);
        assert_eq!(f.pool.texture_generation(f.scaled), Some(1));
        assert_eq!(f.pool.texture_extent(f.scaled), Some(Extent::flat(400, 300)));
        assert_ne!(f.pool.buffer(f.per_pixel).unwrap().id, pixels_id);
        assert_eq!(f.pool.buffer_generation(f.per_pixel), Some(1));
    }

    #[test]
    fn test_resize_to_same_surface_is_noop() {
        let gpu = RecordingGpu::default();
        let mut f = fixture();
        f.pool.materialize(&gpu, surface(640, 480)).unwrap();
        assert_eq!(f.pool.resize(&gpu, surface(640, 480)).unwrap(), 0);
        assert_eq!(f.pool.texture_generation(f.scaled), Some(0));
    }
}
