//! The wgpu implementation of [`Gpu`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kiln_core::resource::SampleKind;
use kiln_core::{BufferUsage, DeviceCaps, Extent, PixelFormat, TextureDimension, TextureUsage};
use wgpu::util::DeviceExt;

use crate::binding::{BindingKind, LayoutEntry, StageMask};
use crate::component::{BlendMode, LoadAction, Topology};
use crate::filters::{ImageFilter, FILTER_WORKGROUP};
use crate::gpu::{
    BoundResource, BufferSpec, CommandEncoder, ComputePipelineSpec, DispatchCommand, DrawCommand,
    Gpu, GpuError, IndexFormat, RenderPipelineSpec, TextureSpec,
};

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

enum TextureStorage {
    Owned(wgpu::Texture),
    Surface(wgpu::SurfaceTexture),
}

pub struct WgpuTexture {
    storage: TextureStorage,
    view: wgpu::TextureView,
}

impl WgpuTexture {
    /// Wrap the current swapchain image so passes can target it.
    pub fn from_surface(frame: wgpu::SurfaceTexture) -> Self {
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            storage: TextureStorage::Surface(frame),
            view,
        }
    }

    pub fn raw(&self) -> &wgpu::Texture {
        match &self.storage {
            TextureStorage::Owned(texture) => texture,
            TextureStorage::Surface(frame) => &frame.texture,
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Present a wrapped swapchain image. No-op for owned textures.
    pub fn present(self) {
        if let TextureStorage::Surface(frame) = self.storage {
            frame.present();
        }
    }
}

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct WgpuFilter {
    name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: Arc<wgpu::BindGroupLayout>,
    params: wgpu::Buffer,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct WgpuGpu {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    layouts: Mutex<HashMap<Vec<LayoutEntry>, Arc<wgpu::BindGroupLayout>>>,
}

impl WgpuGpu {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device: Arc::new(device),
            queue,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Open the best adapter, optionally one able to present to `surface`.
    pub async fn request(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<(wgpu::Adapter, Self), GpuError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GpuError::creation("adapter", "no suitable GPU adapter found"))?;

        let info = adapter.get_info();
        tracing::info!("GPU: {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("kiln device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuError::creation("device", e))?;
        Ok((adapter, Self::new(device, queue)))
    }

    /// A device without any surface, for offscreen runs.
    pub fn headless() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let (_, gpu) = pollster::block_on(Self::request(&instance, None))?;
        Ok(gpu)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Run `create` inside a validation error scope.
    fn scoped<T>(&self, what: &str, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(GpuError::creation(what, err)),
            None => Ok(value),
        }
    }

    fn bind_group_layout(&self, entries: &[LayoutEntry]) -> Arc<wgpu::BindGroupLayout> {
        let mut layouts = self.layouts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(layout) = layouts.get(entries) {
            return Arc::clone(layout);
        }
        let wgpu_entries: Vec<_> = entries.iter().map(layout_entry).collect();
        let layout = Arc::new(
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("kiln bind group layout"),
                    entries: &wgpu_entries,
                }),
        );
        layouts.insert(entries.to_vec(), Arc::clone(&layout));
        layout
    }

    fn pipeline_layout(&self, label: &str, groups: &[Vec<LayoutEntry>]) -> wgpu::PipelineLayout {
        let layouts: Vec<_> = groups.iter().map(|g| self.bind_group_layout(g)).collect();
        let refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().map(|l| &**l).collect();
        self.device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &refs,
                push_constant_ranges: &[],
            })
    }
}

impl Gpu for WgpuGpu {
    type Texture = WgpuTexture;
    type Buffer = WgpuBuffer;
    type Program = wgpu::ShaderModule;
    type ComputePipeline = wgpu::ComputePipeline;
    type RenderPipeline = wgpu::RenderPipeline;
    type BindGroup = wgpu::BindGroup;
    type Filter = WgpuFilter;
    type Encoder = WgpuEncoder;
    type Submission = wgpu::SubmissionIndex;

    fn caps(&self) -> DeviceCaps {
        // WebGPU always dispatches whole workgroups.
        DeviceCaps {
            non_uniform_dispatch: false,
        }
    }

    fn create_texture(&self, spec: &TextureSpec) -> Result<WgpuTexture, GpuError> {
        let (dimension, view_dimension) = match spec.dimension {
            TextureDimension::D1 => (wgpu::TextureDimension::D1, wgpu::TextureViewDimension::D1),
            TextureDimension::D2 => (wgpu::TextureDimension::D2, wgpu::TextureViewDimension::D2),
            TextureDimension::D2Array => {
                (wgpu::TextureDimension::D2, wgpu::TextureViewDimension::D2Array)
            }
            TextureDimension::D3 => (wgpu::TextureDimension::D3, wgpu::TextureViewDimension::D3),
            TextureDimension::Cube => {
                (wgpu::TextureDimension::D2, wgpu::TextureViewDimension::Cube)
            }
        };
        let texture = self.scoped(&spec.label, |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&spec.label),
                size: extent_3d(spec.extent),
                mip_level_count: 1,
                sample_count: 1,
                dimension,
                format: texture_format(spec.format),
                usage: texture_usage(spec.usage),
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&spec.label),
            dimension: Some(view_dimension),
            ..Default::default()
        });
        Ok(WgpuTexture {
            storage: TextureStorage::Owned(texture),
            view,
        })
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<WgpuBuffer, GpuError> {
        // Copies and clears work in 4-byte steps.
        let size = spec.size.max(4).next_multiple_of(4);
        let buffer = self.scoped(&spec.label, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&spec.label),
                size,
                usage: buffer_usage(spec.usage),
                mapped_at_creation: false,
            })
        })?;
        Ok(WgpuBuffer { buffer, size })
    }

    fn write_buffer(&self, buffer: &WgpuBuffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(&buffer.buffer, offset, data);
    }

    fn create_program(&self, label: &str, source: &str) -> Result<wgpu::ShaderModule, GpuError> {
        self.scoped(label, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            })
        })
    }

    fn create_compute_pipeline(
        &self,
        spec: &ComputePipelineSpec<'_, Self>,
    ) -> Result<wgpu::ComputePipeline, GpuError> {
        let layout = self.pipeline_layout(spec.label, spec.groups);
        self.scoped(spec.label, |device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(spec.label),
                layout: Some(&layout),
                module: spec.program,
                entry_point: Some(spec.entry),
                compilation_options: Default::default(),
                cache: None,
            })
        })
    }

    fn create_render_pipeline(
        &self,
        spec: &RenderPipelineSpec<'_, Self>,
    ) -> Result<wgpu::RenderPipeline, GpuError> {
        let layout = self.pipeline_layout(spec.label, spec.groups);
        let targets: Vec<_> = spec
            .targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: texture_format(target.format),
                    blend: Some(blend_state(target.blend)),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        self.scoped(spec.label, |device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(spec.label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: spec.program,
                    entry_point: Some(spec.vertex_entry),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: spec.program,
                    entry_point: Some(spec.fragment_entry),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: primitive_topology(spec.topology),
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: spec.depth.map(|format| wgpu::DepthStencilState {
                    format: texture_format(format),
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        layout: &[LayoutEntry],
        resources: &[BoundResource<'_, Self>],
    ) -> Result<wgpu::BindGroup, GpuError> {
        if layout.len() != resources.len() {
            return Err(GpuError::creation(
                label,
                format!("{} layout entries, {} resources", layout.len(), resources.len()),
            ));
        }
        let group_layout = self.bind_group_layout(layout);
        let entries: Vec<_> = layout
            .iter()
            .zip(resources)
            .map(|(entry, resource)| wgpu::BindGroupEntry {
                binding: entry.binding,
                resource: match resource {
                    BoundResource::Buffer(buffer) => buffer.buffer.as_entire_binding(),
                    BoundResource::Texture(texture) => {
                        wgpu::BindingResource::TextureView(&texture.view)
                    }
                },
            })
            .collect();
        self.scoped(label, |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &group_layout,
                entries: &entries,
            })
        })
    }

    fn create_filter(&self, filter: &ImageFilter, destination: PixelFormat) -> Result<WgpuFilter, GpuError> {
        let source = filter.source(destination).ok_or_else(|| {
            GpuError::Unsupported(format!("{} into {destination:?}", filter.name()))
        })?;
        let layout = self.bind_group_layout(&[
            LayoutEntry {
                binding: 0,
                kind: BindingKind::Texture {
                    dimension: TextureDimension::D2,
                    sample: SampleKind::Float,
                },
                visibility: StageMask::COMPUTE,
            },
            LayoutEntry {
                binding: 1,
                kind: BindingKind::StorageTexture {
                    dimension: TextureDimension::D2,
                    format: destination,
                    read_write: false,
                },
                visibility: StageMask::COMPUTE,
            },
            LayoutEntry {
                binding: 2,
                kind: BindingKind::Uniform,
                visibility: StageMask::COMPUTE,
            },
        ]);
        let module = self.create_program(filter.name(), &source)?;
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(filter.name()),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self.scoped(filter.name(), |device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(filter.name()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(filter.name()),
                contents: bytemuck::cast_slice(&filter.params()),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        Ok(WgpuFilter {
            name: filter.name(),
            pipeline,
            layout,
            params,
        })
    }

    fn create_encoder(&self, label: &str) -> Result<WgpuEncoder, GpuError> {
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        Ok(WgpuEncoder {
            device: Arc::clone(&self.device),
            encoder,
        })
    }

    fn submit(&self, encoder: WgpuEncoder) -> Result<wgpu::SubmissionIndex, GpuError> {
        Ok(self.queue.submit(Some(encoder.encoder.finish())))
    }

    fn wait(&self, submission: &wgpu::SubmissionIndex) -> Result<(), GpuError> {
        let result = self
            .device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(submission.clone()));
        if result.is_queue_empty() {
            tracing::trace!("queue drained");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

pub struct WgpuEncoder {
    device: Arc<wgpu::Device>,
    encoder: wgpu::CommandEncoder,
}

impl CommandEncoder<WgpuGpu> for WgpuEncoder {
    fn dispatch(&mut self, command: &DispatchCommand<'_, WgpuGpu>) -> Result<(), GpuError> {
        let [x, y, z] = command.size.workgroups();
        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(command.label),
                timestamp_writes: None,
            });
        pass.set_pipeline(command.pipeline);
        for (index, group) in (0u32..).zip(command.groups) {
            pass.set_bind_group(index, *group, &[]);
        }
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn draw(&mut self, command: &DrawCommand<'_, WgpuGpu>) -> Result<(), GpuError> {
        let colors: Vec<_> = command
            .colors
            .iter()
            .map(|color| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &color.texture.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match color.load {
                            LoadAction::Clear([r, g, b, a]) => {
                                wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a })
                            }
                            LoadAction::Load => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth = command
            .depth
            .as_ref()
            .map(|depth| wgpu::RenderPassDepthStencilAttachment {
                view: &depth.texture.view,
                depth_ops: Some(wgpu::Operations {
                    load: depth.clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            });

        let mut pass = self.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(command.label),
            color_attachments: &colors,
            depth_stencil_attachment: depth,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(command.pipeline);
        for (index, group) in (0u32..).zip(command.groups) {
            pass.set_bind_group(index, *group, &[]);
        }
        match &command.index {
            Some(index) => {
                let format = match index.format {
                    IndexFormat::U16 => wgpu::IndexFormat::Uint16,
                    IndexFormat::U32 => wgpu::IndexFormat::Uint32,
                };
                pass.set_index_buffer(index.buffer.buffer.slice(..), format);
                pass.draw_indexed(0..index.count, 0, 0..command.instances);
            }
            None => pass.draw(0..command.vertices, 0..command.instances),
        }
        Ok(())
    }

    fn copy_texture(
        &mut self,
        source: &WgpuTexture,
        destination: &WgpuTexture,
        extent: Extent,
    ) -> Result<(), GpuError> {
        self.encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: source.raw(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: destination.raw(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            extent_3d(extent),
        );
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        source: &WgpuBuffer,
        destination: &WgpuBuffer,
        size: u64,
    ) -> Result<(), GpuError> {
        let size = size & !3;
        if size > 0 {
            self.encoder
                .copy_buffer_to_buffer(&source.buffer, 0, &destination.buffer, 0, size);
        }
        Ok(())
    }

    fn clear_buffer(&mut self, buffer: &WgpuBuffer) -> Result<(), GpuError> {
        self.encoder.clear_buffer(&buffer.buffer, 0, None);
        Ok(())
    }

    fn apply_filter(
        &mut self,
        filter: &WgpuFilter,
        source: &WgpuTexture,
        destination: &WgpuTexture,
        extent: Extent,
    ) -> Result<(), GpuError> {
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(filter.name),
            layout: &filter.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&destination.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: filter.params.as_entire_binding(),
                },
            ],
        });
        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(filter.name),
                timestamp_writes: None,
            });
        pass.set_pipeline(&filter.pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.dispatch_workgroups(
            extent.width.div_ceil(FILTER_WORKGROUP),
            extent.height.div_ceil(FILTER_WORKGROUP),
            1,
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

pub fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    use wgpu::TextureFormat as F;
    match format {
        PixelFormat::R8Unorm => F::R8Unorm,
        PixelFormat::Rg8Unorm => F::Rg8Unorm,
        PixelFormat::Rgba8Unorm => F::Rgba8Unorm,
        PixelFormat::Rgba8UnormSrgb => F::Rgba8UnormSrgb,
        PixelFormat::Bgra8Unorm => F::Bgra8Unorm,
        PixelFormat::Bgra8UnormSrgb => F::Bgra8UnormSrgb,
        PixelFormat::R16Float => F::R16Float,
        PixelFormat::Rg16Float => F::Rg16Float,
        PixelFormat::Rgba16Float => F::Rgba16Float,
        PixelFormat::R32Float => F::R32Float,
        PixelFormat::Rg32Float => F::Rg32Float,
        PixelFormat::Rgba32Float => F::Rgba32Float,
        PixelFormat::R32Uint => F::R32Uint,
        PixelFormat::R32Sint => F::R32Sint,
        PixelFormat::Rgba32Uint => F::Rgba32Uint,
        PixelFormat::Depth32Float => F::Depth32Float,
    }
}

/// The pixel format of a surface, if it is one the graph understands.
pub fn pixel_format(format: wgpu::TextureFormat) -> Option<PixelFormat> {
    use wgpu::TextureFormat as F;
    Some(match format {
        F::Rgba8Unorm => PixelFormat::Rgba8Unorm,
        F::Rgba8UnormSrgb => PixelFormat::Rgba8UnormSrgb,
        F::Bgra8Unorm => PixelFormat::Bgra8Unorm,
        F::Bgra8UnormSrgb => PixelFormat::Bgra8UnormSrgb,
        F::Rgba16Float => PixelFormat::Rgba16Float,
        _ => return None,
    })
}

fn extent_3d(extent: Extent) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: extent.width.max(1),
        height: extent.height.max(1),
        depth_or_array_layers: extent.depth.max(1),
    }
}

fn texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::STORAGE) {
        out |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    out
}

fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::STORAGE) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        out |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    out
}

fn view_dimension(dimension: TextureDimension) -> wgpu::TextureViewDimension {
    match dimension {
        TextureDimension::D1 => wgpu::TextureViewDimension::D1,
        TextureDimension::D2 => wgpu::TextureViewDimension::D2,
        TextureDimension::D2Array => wgpu::TextureViewDimension::D2Array,
        TextureDimension::D3 => wgpu::TextureViewDimension::D3,
        TextureDimension::Cube => wgpu::TextureViewDimension::Cube,
    }
}

fn layout_entry(entry: &LayoutEntry) -> wgpu::BindGroupLayoutEntry {
    let mut visibility = wgpu::ShaderStages::empty();
    if entry.visibility.contains(StageMask::COMPUTE) {
        visibility |= wgpu::ShaderStages::COMPUTE;
    }
    if entry.visibility.contains(StageMask::VERTEX) {
        visibility |= wgpu::ShaderStages::VERTEX;
    }
    if entry.visibility.contains(StageMask::FRAGMENT) {
        visibility |= wgpu::ShaderStages::FRAGMENT;
    }
    let ty = match entry.kind {
        BindingKind::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Storage { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        // No samplers are bound, so float textures never need filtering.
        BindingKind::Texture { dimension, sample } => wgpu::BindingType::Texture {
            sample_type: match sample {
                SampleKind::Float => wgpu::TextureSampleType::Float { filterable: false },
                SampleKind::Uint => wgpu::TextureSampleType::Uint,
                SampleKind::Sint => wgpu::TextureSampleType::Sint,
                SampleKind::Depth => wgpu::TextureSampleType::Depth,
            },
            view_dimension: view_dimension(dimension),
            multisampled: false,
        },
        BindingKind::StorageTexture {
            dimension,
            format,
            read_write,
        } => wgpu::BindingType::StorageTexture {
            access: if read_write {
                wgpu::StorageTextureAccess::ReadWrite
            } else {
                wgpu::StorageTextureAccess::WriteOnly
            },
            format: texture_format(format),
            view_dimension: view_dimension(dimension),
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: entry.binding,
        visibility,
        ty,
        count: None,
    }
}

fn blend_state(mode: BlendMode) -> wgpu::BlendState {
    match mode {
        BlendMode::Replace => wgpu::BlendState::REPLACE,
        BlendMode::Alpha => wgpu::BlendState::ALPHA_BLENDING,
        BlendMode::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            wgpu::BlendState {
                color: add,
                alpha: add,
            }
        }
    }
}

fn primitive_topology(topology: Topology) -> wgpu::PrimitiveTopology {
    match topology {
        Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        Topology::LineList => wgpu::PrimitiveTopology::LineList,
        Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        Topology::PointList => wgpu::PrimitiveTopology::PointList,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_formats_map_back() {
        for format in [
            PixelFormat::Bgra8UnormSrgb,
            PixelFormat::Rgba8Unorm,
            PixelFormat::Rgba16Float,
        ] {
            assert_eq!(pixel_format(texture_format(format)), Some(format));
        }
        assert_eq!(pixel_format(wgpu::TextureFormat::Depth24Plus), None);
    }

    #[test]
    fn test_usage_flags_translate() {
        let usage = texture_usage(TextureUsage::SAMPLED | TextureUsage::STORAGE);
        assert_eq!(
            usage,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING
        );
        assert_eq!(
            buffer_usage(BufferUsage::STORAGE | BufferUsage::COPY_DST),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST
        );
    }

    #[test]
    fn test_layout_entry_visibility() {
        let entry = layout_entry(&LayoutEntry {
            binding: 3,
            kind: BindingKind::Storage { read_only: true },
            visibility: StageMask::VERTEX | StageMask::FRAGMENT,
        });
        assert_eq!(entry.binding, 3);
        assert_eq!(
            entry.visibility,
            wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT
        );
    }
}
