//! The built pass graph and the frame driver contract.
//!
//! `build` compiles the component tree and turns it into passes, `setup`
//! creates programs, resources, pipelines and bind groups once, `resize`
//! follows the display surface and `encode` records one frame into a
//! [`CommandStream`] for the driver to submit or drop.

use std::sync::Arc;

use kiln_core::{CompileError, ResourceTable, ScalarType};
use thiserror::Error;

use crate::async_group::AsyncGroupPass;
use crate::compiler::{compile, CompileOptions, CompiledLeaf, CompiledProgram};
use crate::component::{Component, Program};
use crate::flatten::LeafId;
use crate::frame::{CommandStream, GraphContext, PassInfo, RenderInfo, SurfaceInfo};
use crate::gpu::{Gpu, GpuError, IndexFormat};
use crate::pass::{Pass, PassError};
use crate::passes::{BlitPass, CallbackPass, DispatchPass, DrawPass, DrawSetup, FilterPass, GroupPass};
use crate::resources::ResourcePool;
use crate::validation::{validate_unit, ValidationError};

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    /// Run every generated unit through naga before creating programs.
    pub validate: bool,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("program unit '{unit}': {source}")]
    Program {
        unit: String,
        #[source]
        source: GpuError,
    },
    #[error("unit '{unit}' is not valid WGSL: {source}")]
    Validation {
        unit: String,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Pass(#[from] PassError),
    #[error("the pass graph has not been set up")]
    NotSetUp,
    #[error("leaf {0} of the component tree has no matching compiled leaf")]
    LeafMismatch(usize),
}

pub struct PassGraph<G: Gpu> {
    context: Arc<GraphContext<G>>,
    passes: Vec<Box<dyn Pass<G>>>,
    ready: bool,
    frame: u64,
}

impl<G: Gpu> PassGraph<G> {
    /// Compile `program` against `table` for this device and build its
    /// passes. Nothing is created on the GPU yet.
    pub fn build(
        gpu: Arc<G>,
        program: Program<G>,
        table: ResourceTable,
        options: GraphOptions,
    ) -> Result<Self, GraphError> {
        let compiled = compile(&program, &table, &CompileOptions { caps: gpu.caps() })?;
        if options.validate {
            for unit in &compiled.units {
                validate_unit(&unit.label, &unit.source).map_err(|source| GraphError::Validation {
                    unit: unit.label.clone(),
                    source,
                })?;
            }
        }
        let passes = PassBuilder {
            compiled: &compiled,
            table: &table,
            next_leaf: 0,
        }
        .build_all(program.root)?;

        tracing::info!(
            "built pass graph: {} units, {} leaves, {} textures, {} buffers",
            compiled.units.len(),
            compiled.leaves.len(),
            compiled.resources.textures.len(),
            compiled.resources.buffers.len()
        );
        let pool = ResourcePool::new(table, compiled.resources.clone());
        Ok(Self {
            context: Arc::new(GraphContext::new(gpu, compiled, pool)),
            passes,
            ready: false,
            frame: 0,
        })
    }

    pub fn compiled(&self) -> &CompiledProgram {
        &self.context.compiled
    }

    pub fn context(&self) -> &Arc<GraphContext<G>> {
        &self.context
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Frames encoded so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Create programs, materialize resources and set every pass up.
    /// Calling it again only follows the surface.
    pub fn setup(&mut self, surface: SurfaceInfo) -> Result<(), GraphError> {
        if self.ready {
            return self.resize(surface);
        }
        let gpu = &self.context.gpu;
        let mut programs = Vec::with_capacity(self.context.compiled.units.len());
        for unit in &self.context.compiled.units {
            let program = gpu
                .create_program(&unit.label, &unit.source)
                .map_err(|source| GraphError::Program {
                    unit: unit.label.clone(),
                    source,
                })?;
            programs.push(program);
        }
        if !self.context.set_programs(programs) {
            tracing::debug!("programs were created by an earlier setup attempt");
        }
        self.context.resources_mut().materialize(gpu, surface)?;
        self.context.set_surface(surface);

        let resources = self.context.resources();
        let info = RenderInfo {
            context: &self.context,
            resources: &*resources,
            surface,
        };
        for pass in &mut self.passes {
            pass.setup(&info)?;
        }
        self.ready = true;
        tracing::info!(
            "pass graph set up at {}x{}",
            surface.extent.width,
            surface.extent.height
        );
        Ok(())
    }

    /// Follow a display surface change. Only surface-derived resources are
    /// recreated; bind groups notice on the next frame.
    pub fn resize(&mut self, surface: SurfaceInfo) -> Result<(), GraphError> {
        if self.ready {
            self.context
                .resources_mut()
                .resize(&self.context.gpu, surface)?;
        }
        self.context.set_surface(surface);
        Ok(())
    }

    /// Record one frame. Dropping the returned stream drops the frame.
    pub fn encode(
        &mut self,
        surface_texture: Option<&G::Texture>,
        surface: SurfaceInfo,
    ) -> Result<CommandStream<G>, GraphError> {
        if !self.ready {
            return Err(GraphError::NotSetUp);
        }
        if self.context.surface() != Some(surface) {
            self.resize(surface)?;
        }

        let context = Arc::clone(&self.context);
        let resources = context.resources();
        let info = RenderInfo {
            context: &context,
            resources: &*resources,
            surface,
        };
        for pass in &mut self.passes {
            pass.pre_run(&info)?;
        }

        let mut stream = CommandStream::new(Arc::clone(&context.gpu), format!("frame {}", self.frame));
        let mut pass_info = PassInfo {
            gpu: &*context.gpu,
            resources: &*resources,
            stream: &mut stream,
            surface: surface_texture,
            surface_info: surface,
            frame: self.frame,
        };
        for pass in &mut self.passes {
            pass.encode(&mut pass_info)?;
        }
        tracing::trace!("encoded frame {}", self.frame);
        self.frame += 1;
        Ok(stream)
    }

    /// Encode and submit one frame.
    pub fn run_frame(
        &mut self,
        surface_texture: Option<&G::Texture>,
        surface: SurfaceInfo,
    ) -> Result<Vec<G::Submission>, GraphError> {
        Ok(self.encode(surface_texture, surface)?.finish()?)
    }
}

// ---------------------------------------------------------------------------
// Pass construction
// ---------------------------------------------------------------------------

/// Walks the tree in the same pre-order as the compiler's flatten pass, so
/// the n-th leaf met here is compiled leaf n.
struct PassBuilder<'a> {
    compiled: &'a CompiledProgram,
    table: &'a ResourceTable,
    next_leaf: usize,
}

impl<'a> PassBuilder<'a> {
    fn leaf(&mut self) -> Result<&'a CompiledLeaf, GraphError> {
        let id = LeafId(self.next_leaf);
        self.next_leaf += 1;
        self.compiled
            .leaf(id)
            .ok_or(GraphError::LeafMismatch(id.0))
    }

    fn build_all<G: Gpu>(&mut self, components: Vec<Component<G>>) -> Result<Vec<Box<dyn Pass<G>>>, GraphError> {
        components
            .into_iter()
            .map(|component| self.build(component))
            .collect()
    }

    fn build<G: Gpu>(&mut self, component: Component<G>) -> Result<Box<dyn Pass<G>>, GraphError> {
        let mismatch = GraphError::LeafMismatch(self.next_leaf);
        Ok(match component {
            Component::Dispatch(dispatch) => match self.leaf()? {
                CompiledLeaf::Dispatch(compiled) => Box::new(DispatchPass::new(
                    dispatch.label,
                    compiled.clone(),
                    dispatch.wait_until_completed,
                )),
                _ => return Err(mismatch),
            },
            Component::Draw(draw) => {
                let compiled = match self.leaf()? {
                    CompiledLeaf::Draw(compiled) => compiled.clone(),
                    _ => return Err(mismatch),
                };
                let index = draw.index.map(|buffer| {
                    let narrow = self
                        .table
                        .buffer_decl(buffer)
                        .is_some_and(|decl| decl.element.is_scalar(ScalarType::U16));
                    let format = if narrow { IndexFormat::U16 } else { IndexFormat::U32 };
                    (buffer, format)
                });
                Box::new(DrawPass::new(
                    draw.label,
                    compiled,
                    DrawSetup {
                        targets: draw.targets,
                        depth: draw.depth,
                        topology: draw.topology,
                        vertices: draw.vertices,
                        instances: draw.instances,
                        index,
                    },
                ))
            }
            Component::Blit(blit) => {
                self.leaf()?;
                Box::new(BlitPass::new(blit.label, blit.op))
            }
            Component::VendorFilter(filter) => {
                self.leaf()?;
                Box::new(FilterPass::new(
                    filter.label,
                    filter.filter,
                    filter.source,
                    filter.destination,
                ))
            }
            Component::ManualCallback(callback) => {
                self.leaf()?;
                Box::new(CallbackPass::new(callback.label, callback.callback))
            }
            Component::Group(group) => {
                let children = self.build_all(group.children)?;
                Box::new(GroupPass::new(group.label, children, group.repeat, group.active))
            }
            Component::AsyncGroup(group) => {
                let children = self.build_all(group.children)?;
                Box::new(AsyncGroupPass::new(group.label, group.link, children))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::async_group::{AsyncGroupHandle, AsyncState};
    use crate::component::{AsyncGroup, Blit, Dispatch, Draw, Group, LoadAction, ManualCallback};
    use crate::gpu::DispatchSize;
    use crate::recording::{RecordedCommand, RecordingGpu};
    use kiln_core::{
        Argument, Counter, DeviceCaps, Extent, Flag, PixelFormat, ResourceSize, TextureDecl,
        TextureRef, Uniform,
    };

    fn surface(width: u32, height: u32) -> SurfaceInfo {
        SurfaceInfo::new(width, height, PixelFormat::Bgra8UnormSrgb)
    }

    fn step_kernel(data: kiln_core::BufferHandle) -> Dispatch {
        Dispatch::new("step", "@compute fn step() { data[gid.x] = data[gid.x] + 1.0; }")
            .arg(Argument::buffer("data", data))
            .fit_buffer("data")
    }

    /// Commands of the last submission.
    fn last_frame(gpu: &RecordingGpu) -> Vec<RecordedCommand> {
        gpu.submissions()
            .last()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    fn labels(commands: &[RecordedCommand]) -> Vec<String> {
        commands.iter().map(|c| c.label().to_string()).collect()
    }

    #[test]
    fn test_group_repeat_and_activation() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 100);
        let scratch = table.buffer::<u32>("scratch", 4);

        let repeat = Counter::new(0);
        let active = Flag::new(true);
        let program = Program::new("").with(
            Group::new("loop")
                .repeat(repeat.clone())
                .active_when(active.clone())
                .child(step_kernel(data))
                .child(Blit::clear_buffer(scratch)),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        // Zero repeats: nothing encoded, nothing submitted.
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert!(gpu.submissions().is_empty());

        repeat.set(3);
        active.set(false);
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert!(gpu.submissions().is_empty());

        active.set(true);
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert_eq!(
            labels(&last_frame(&gpu)),
            vec!["step", "clear buffer", "step", "clear buffer", "step", "clear buffer"]
        );
        assert_eq!(graph.frame(), 3);
    }

    #[test]
    fn test_dispatch_sizes_follow_device_caps() {
        for (caps, expected) in [
            (DeviceCaps::default(), DispatchSize::Workgroups([2, 1, 1])),
            (
                DeviceCaps {
                    non_uniform_dispatch: true,
                },
                DispatchSize::Threads {
                    threads: [100, 1, 1],
                    workgroup: [64, 1, 1],
                },
            ),
        ] {
            let gpu = Arc::new(RecordingGpu::new(caps));
            let mut table = ResourceTable::new();
            let data = table.buffer::<f32>("data", 100);
            let program = Program::new("").with(step_kernel(data));
            let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
            graph.setup(surface(64, 64)).unwrap();
            graph.run_frame(None, surface(64, 64)).unwrap();

            match &last_frame(&gpu)[..] {
                [RecordedCommand::Dispatch { size, entry, .. }] => {
                    assert_eq!(*size, expected);
                    assert_eq!(entry, "step");
                }
                other => panic!("unexpected commands {other:?}"),
            }
        }
    }

    #[test]
    fn test_wait_until_completed_splits_frame() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let program = Program::new("")
            .with(step_kernel(data).label("first").wait_until_completed())
            .with(step_kernel(data).label("second"));
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        let submissions = graph.run_frame(None, surface(64, 64)).unwrap();
        assert_eq!(submissions.len(), 2);
        let recorded = gpu.submissions();
        assert_eq!(labels(&recorded[0].commands), vec!["first"]);
        assert_eq!(labels(&recorded[1].commands), vec!["second"]);
        // The duplicate entry point was renamed.
        assert!(matches!(
            &recorded[1].commands[0],
            RecordedCommand::Dispatch { entry, .. } if entry == "step_1"
        ));
    }

    #[test]
    fn test_resize_rebinds_surface_sized_textures() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let image = table.add_texture(TextureDecl::new(
            "image",
            ResourceSize::Viewport,
            PixelFormat::Rgba8Unorm,
        ));
        let lut = table.buffer::<f32>("lut", 256);
        let program = Program::new("").with(
            Dispatch::new(
                "shade",
                "@compute fn shade() { textureStore(image, gid.xy, vec4<f32>(lut[0])); }",
            )
            .arg(Argument::write_texture("image", image))
            .arg(Argument::read_buffer("lut", lut))
            .fit_texture("image"),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(640, 480)).unwrap();

        let dispatch = |gpu: &RecordingGpu| match &last_frame(gpu)[..] {
            [RecordedCommand::Dispatch { size, groups, .. }] => (*size, groups.clone()),
            other => panic!("unexpected commands {other:?}"),
        };

        graph.run_frame(None, surface(640, 480)).unwrap();
        let (size, before) = dispatch(&gpu);
        assert_eq!(size, DispatchSize::Workgroups([80, 60, 1]));
        let lut_id = graph.context().resources().buffer(lut).unwrap().id;

        graph.resize(surface(800, 600)).unwrap();
        graph.run_frame(None, surface(800, 600)).unwrap();
        let (size, after) = dispatch(&gpu);
        assert_eq!(size, DispatchSize::Workgroups([100, 75, 1]));
        assert_ne!(before, after);
        assert_eq!(graph.context().resources().buffer(lut).unwrap().id, lut_id);

        // An unchanged surface reuses the bind groups.
        graph.run_frame(None, surface(800, 600)).unwrap();
        assert_eq!(dispatch(&gpu).1, after);
    }

    #[test]
    fn test_failed_resize_is_retried() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let color = table.add_texture(TextureDecl::new(
            "color",
            ResourceSize::Viewport,
            PixelFormat::Rgba8Unorm,
        ));
        let normal = table.add_texture(TextureDecl::new(
            "normal",
            ResourceSize::Viewport,
            PixelFormat::Rgba8Unorm,
        ));
        let program = Program::new("").with(
            Dispatch::new(
                "shade",
                "@compute fn shade() { textureStore(color, gid.xy, vec4<f32>(1.0)); \
                 textureStore(normal, gid.xy, vec4<f32>(0.0)); }",
            )
            .arg(Argument::write_texture("color", color))
            .arg(Argument::write_texture("normal", normal))
            .fit_texture("color"),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();
        graph.run_frame(None, surface(64, 64)).unwrap();

        gpu.fail_texture("normal");
        assert!(graph.run_frame(None, surface(128, 64)).is_err());
        assert_eq!(graph.context().surface(), Some(surface(64, 64)));

        graph.run_frame(None, surface(128, 64)).unwrap();
        let resources = graph.context().resources();
        for texture in [color, normal] {
            assert_eq!(resources.texture_extent(texture), Some(Extent::new(128, 64, 1)));
        }
        assert_eq!(resources.surface(), Some(surface(128, 64)));
    }

    #[test]
    fn test_argument_buffer_rebinds_on_resize() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let image = table.add_texture(TextureDecl::new(
            "image",
            ResourceSize::Viewport,
            PixelFormat::Rgba8Unorm,
        ));
        let out = table.buffer::<f32>("out", 16);
        let program = Program::new("").with(
            Dispatch::new(
                "shade",
                "@compute fn shade() { textureStore(image, vec2<u32>(gid.x, 0u), vec4<f32>(out[gid.x])); }",
            )
            .arg(Argument::read_buffer("out", out))
            .arg(Argument::argument_buffer(
                "scene",
                vec![Argument::write_texture("image", image)],
            ))
            .fit_buffer("out"),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions { validate: true }).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        let groups = |gpu: &RecordingGpu| match &last_frame(gpu)[..] {
            [RecordedCommand::Dispatch { groups, .. }] => groups.clone(),
            other => panic!("unexpected commands {other:?}"),
        };

        graph.run_frame(None, surface(64, 64)).unwrap();
        let before = groups(&gpu);
        assert_eq!(before.len(), 2);

        graph.run_frame(None, surface(128, 64)).unwrap();
        let after = groups(&gpu);
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_eq!(
            graph.context().resources().texture_extent(image),
            Some(Extent::new(128, 64, 1))
        );
    }

    #[test]
    fn test_inactive_group_uploads_nothing() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 64);
        let gain = Uniform::new(2.0f32);
        let active = Flag::new(false);
        let program = Program::new("").with(
            Group::new("scaled").active_when(active.clone()).child(
                Dispatch::new("scale", "@compute fn scale() { data[gid.x] = data[gid.x] * gain; }")
                    .arg(Argument::buffer("data", data))
                    .arg(Argument::bytes("gain", &gain))
                    .fit_buffer("data"),
            ),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        graph.run_frame(None, surface(64, 64)).unwrap();
        assert!(gpu.writes().is_empty());
        assert!(gpu.submissions().is_empty());

        active.set(true);
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert_eq!(gpu.writes().len(), 2);
        assert_eq!(labels(&last_frame(&gpu)), vec!["scale"]);
    }

    #[test]
    fn test_bytes_are_uploaded_every_frame() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 64);
        let gain = Uniform::new(2.0f32);
        let program = Program::new("").with(
            Dispatch::new("scale", "@compute fn scale() { data[gid.x] = data[gid.x] * gain; }")
                .arg(Argument::buffer("data", data))
                .arg(Argument::bytes("gain", &gain))
                .fit_buffer("data"),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        graph.run_frame(None, surface(64, 64)).unwrap();
        let first = gpu.writes().len();
        // Bytes block and grid extent.
        assert_eq!(first, 2);
        gain.set(3.0);
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert_eq!(gpu.writes().len(), 4);
    }

    #[test]
    fn test_surface_target_needs_surface_texture() {
        let gpu = Arc::new(RecordingGpu::default());
        let source = "@vertex fn vs() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }\n\
                      @fragment fn fs() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let program = Program::new("").with(
            Draw::new("vs", "fs", source).target(TextureRef::Surface, LoadAction::Clear([0.0; 4])),
        );
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, ResourceTable::new(), GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        let result = graph.encode(None, surface(64, 64));
        assert!(matches!(
            result,
            Err(GraphError::Pass(PassError::NoSurface { .. }))
        ));

        let texture = gpu
            .create_texture(&crate::gpu::TextureSpec {
                label: "surface".into(),
                extent: kiln_core::Extent::flat(64, 64),
                dimension: kiln_core::TextureDimension::D2,
                format: PixelFormat::Bgra8UnormSrgb,
                usage: kiln_core::TextureUsage::RENDER_TARGET,
            })
            .unwrap();
        graph.run_frame(Some(&texture), surface(64, 64)).unwrap();
        match &last_frame(&gpu)[..] {
            [RecordedCommand::Draw { targets, vertices, .. }] => {
                assert_eq!(targets, &vec![texture.id]);
                assert_eq!(*vertices, 3);
            }
            other => panic!("unexpected commands {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_broken_programs() {
        let gpu = Arc::new(RecordingGpu::default());
        let build = |validate| {
            let mut table = ResourceTable::new();
            let data = table.buffer::<f32>("data", 16);
            let program = Program::new("").with(
                Dispatch::new("k", "@compute fn k() { data[gid.x] = missing_value; }")
                    .arg(Argument::buffer("data", data))
                    .fit_buffer("data"),
            );
            PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions { validate })
        };
        assert!(build(false).is_ok());
        assert!(matches!(
            build(true),
            Err(GraphError::Validation { unit, .. }) if unit == "main"
        ));
    }

    #[test]
    fn test_encode_before_setup_fails() {
        let gpu = Arc::new(RecordingGpu::default());
        let program = Program::new("").with(ManualCallback::new("noop", |_| Ok(())));
        let mut graph =
            PassGraph::build(gpu, program, ResourceTable::new(), GraphOptions::default()).unwrap();
        assert!(matches!(
            graph.encode(None, surface(8, 8)),
            Err(GraphError::NotSetUp)
        ));
    }

    #[test]
    fn test_async_group_runs_off_frame() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 256);
        let handle: AsyncGroupHandle<RecordingGpu> = AsyncGroupHandle::new("bake").unwrap();

        let consumer = handle.clone();
        let program = Program::new("")
            .with(AsyncGroup::new(handle.link()).child(step_kernel(data).label("bake step")))
            .with(ManualCallback::new("consume", move |_| {
                if consumer.is_complete() {
                    consumer.set_ready();
                }
                Ok(())
            }));
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        // Frames never encode the async subtree.
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert!(gpu.submissions().is_empty());

        handle.run(());
        assert!(handle.wait_settled(Duration::from_secs(10)));
        let submissions = gpu.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].label, "bake (async)");
        assert_eq!(labels(&submissions[0].commands), vec!["bake step"]);
        assert!(handle.is_complete());

        // The next frame observes the result and the consumer releases it.
        graph.run_frame(None, surface(64, 64)).unwrap();
        assert_eq!(handle.state(), AsyncState::Idle);
        assert!(!handle.is_busy());
        assert!(handle.was_completed());
    }

    #[test]
    fn test_callback_errors_drop_the_frame() {
        let gpu = Arc::new(RecordingGpu::default());
        let mut table = ResourceTable::new();
        let data = table.buffer::<f32>("data", 16);
        let program = Program::new("")
            .with(step_kernel(data))
            .with(ManualCallback::new("fail", |info| {
                Err(PassError::callback("fail", format!("frame {}", info.frame)))
            }));
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface(64, 64)).unwrap();

        let result = graph.run_frame(None, surface(64, 64));
        assert!(matches!(
            result,
            Err(GraphError::Pass(PassError::Callback { .. }))
        ));
        assert!(gpu.submissions().is_empty());
    }
}
