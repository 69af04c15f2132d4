//! Bundled demo graphs.
//!
//! Every demo is generic over the backend, so the same tree runs in a window
//! on wgpu and headless on the recording backend.

use std::time::Duration;

use kiln_core::{Argument, Counter, PixelFormat, ResourceSize, ResourceTable, TextureDecl, TextureRef, Uniform};
use kiln_graph::{
    AsyncError, AsyncGroup, AsyncGroupHandle, Dispatch, Draw, Gpu, Group, ImageFilter, LoadAction,
    ManualCallback, Program, Topology, VendorFilter,
};
use thiserror::Error;

pub struct DemoInfo {
    pub name: &'static str,
    pub summary: &'static str,
}

pub const DEMOS: &[DemoInfo] = &[
    DemoInfo {
        name: "gradient",
        summary: "compute shader fills a viewport-sized texture, a fullscreen draw presents it",
    },
    DemoInfo {
        name: "particles",
        summary: "repeated integration substeps over a particle buffer, drawn as points",
    },
    DemoInfo {
        name: "filters",
        summary: "noise baked by an async group, blurred by a vendor filter once ready",
    },
];

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("unknown demo '{0}' (see `kiln demos`)")]
    Unknown(String),
    #[error(transparent)]
    Async(#[from] AsyncError),
}

type FrameHook = Box<dyn FnMut(f32) + Send>;

/// A component tree with the resources it binds and the host state that
/// animates it.
pub struct Demo<G: Gpu> {
    pub name: &'static str,
    pub program: Program<G>,
    pub resources: ResourceTable,
    async_groups: Vec<AsyncGroupHandle<G>>,
    frame_hook: Option<FrameHook>,
}

impl<G: Gpu> Demo<G> {
    fn new(name: &'static str, program: Program<G>, resources: ResourceTable) -> Self {
        Self {
            name,
            program,
            resources,
            async_groups: Vec::new(),
            frame_hook: None,
        }
    }

    fn on_frame(mut self, hook: impl FnMut(f32) + Send + 'static) -> Self {
        self.frame_hook = Some(Box::new(hook));
        self
    }

    /// Split into the parts `PassGraph::build` consumes and the part the
    /// driver keeps.
    pub fn into_parts(self) -> (Program<G>, ResourceTable, DemoState<G>) {
        let state = DemoState {
            name: self.name,
            async_groups: self.async_groups,
            frame_hook: self.frame_hook,
        };
        (self.program, self.resources, state)
    }
}

/// Host state of a running demo.
pub struct DemoState<G: Gpu> {
    pub name: &'static str,
    async_groups: Vec<AsyncGroupHandle<G>>,
    frame_hook: Option<FrameHook>,
}

impl<G: Gpu> DemoState<G> {
    /// Update host-side uniforms before a frame is encoded.
    pub fn advance(&mut self, dt: f32) {
        if let Some(hook) = self.frame_hook.as_mut() {
            hook(dt);
        }
    }

    /// Block until every async group of the demo is idle.
    pub fn settle(&self, timeout: Duration) -> bool {
        self.async_groups.iter().all(|group| group.wait_settled(timeout))
    }
}

pub fn build<G: Gpu>(name: &str) -> Result<Demo<G>, DemoError> {
    match name {
        "gradient" => Ok(gradient()),
        "particles" => Ok(particles()),
        "filters" => filters(),
        other => Err(DemoError::Unknown(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Shared WGSL
// ---------------------------------------------------------------------------

const LIBRARY: &str = "\
fn hash_u32(x: u32) -> u32 {
    var h = x * 747796405u + 2891336453u;
    h = ((h >> ((h >> 28u) + 4u)) ^ h) * 277803737u;
    return (h >> 22u) ^ h;
}
";

/// Fullscreen triangle that tiles `image` over the target.
const PRESENT: &str = "\
@vertex
fn present_vs() -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((vertex_id << 1u) & 2u), f32(vertex_id & 2u));
    return vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
}

@fragment
fn present_fs() -> @location(0) vec4<f32> {
    let size = vec2<i32>(textureDimensions(image));
    return textureLoad(image, vec2<i32>(frag_coord.xy) % size, 0);
}
";

fn present(image: kiln_core::TextureHandle) -> Draw {
    Draw::new("present_vs", "present_fs", PRESENT)
        .label("present")
        .fragment_arg(Argument::texture("image", image))
        .target(TextureRef::Surface, LoadAction::Clear([0.02, 0.02, 0.03, 1.0]))
}

// ---------------------------------------------------------------------------
// gradient
// ---------------------------------------------------------------------------

const SHADE: &str = "\
@compute
fn shade() {
    let uv = vec2<f32>(gid.xy) / vec2<f32>(grid_size);
    let wave = 0.5 + 0.5 * sin(time + uv.x * 6.2831853);
    textureStore(image, gid.xy, vec4<f32>(uv.x, wave, uv.y, 1.0));
}
";

fn gradient<G: Gpu>() -> Demo<G> {
    let mut table = ResourceTable::new();
    let image = table.add_texture(TextureDecl::new("image", ResourceSize::Viewport, PixelFormat::Rgba8Unorm));
    let time = Uniform::new(0.0f32);

    let program = Program::new(LIBRARY)
        .with(
            Dispatch::new("shade", SHADE)
                .arg(Argument::write_texture("image", image))
                .arg(Argument::bytes("time", &time))
                .fit_texture("image"),
        )
        .with(present(image));

    Demo::new("gradient", program, table).on_frame(move |dt| time.update(|t| *t += dt))
}

// ---------------------------------------------------------------------------
// particles
// ---------------------------------------------------------------------------

pub const PARTICLE_COUNT: u64 = 4096;
pub const SUBSTEPS: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Particle {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
}
kiln_core::gpu_struct!(Particle { position, velocity });

const INTEGRATE: &str = "\
@compute
fn integrate() {
    var p = particles[gid.x];
    if (all(p.velocity == vec2<f32>(0.0))) {
        let h = hash_u32(gid.x);
        let angle = f32(h & 0xffffu) / 65535.0 * 6.2831853;
        let speed = 0.1 + 0.4 * f32(h >> 16u) / 65535.0;
        p.velocity = vec2<f32>(cos(angle), sin(angle)) * speed;
    }
    p.position += p.velocity * dt;
    if (abs(p.position.x) > 1.0) { p.velocity.x = -p.velocity.x; }
    if (abs(p.position.y) > 1.0) { p.velocity.y = -p.velocity.y; }
    particles[gid.x] = p;
}
";

const POINTS: &str = "\
@vertex
fn point_vs() -> @builtin(position) vec4<f32> {
    return vec4<f32>(particles[vertex_id].position, 0.0, 1.0);
}

@fragment
fn point_fs() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.8, 0.3, 1.0);
}
";

fn particles<G: Gpu>() -> Demo<G> {
    let mut table = ResourceTable::new();
    let particles = table.buffer::<Particle>("particles", PARTICLE_COUNT);
    let dt = Uniform::new(0.0f32);
    let substeps = Counter::new(SUBSTEPS);

    let program = Program::new(LIBRARY)
        .with(
            Group::new("simulate").repeat(substeps).child(
                Dispatch::new("integrate", INTEGRATE)
                    .arg(Argument::buffer("particles", particles))
                    .arg(Argument::bytes("dt", &dt))
                    .fit_buffer("particles"),
            ),
        )
        .with(
            Draw::new("point_vs", "point_fs", POINTS)
                .label("points")
                .vertex_arg(Argument::read_buffer("particles", particles))
                .topology(Topology::PointList)
                .vertices_from(particles)
                .target(TextureRef::Surface, LoadAction::Clear([0.0, 0.0, 0.0, 1.0])),
        );

    Demo::new("particles", program, table)
        .on_frame(move |frame_dt| dt.set(frame_dt.min(0.05) / SUBSTEPS as f32))
}

// ---------------------------------------------------------------------------
// filters
// ---------------------------------------------------------------------------

pub const NOISE_SIZE: u32 = 256;
/// Frames between two bakes.
pub const REBAKE_INTERVAL: u64 = 240;

const BAKE: &str = "\
@compute
fn bake() {
    let h = hash_u32(gid.x + gid.y * grid_size.x + seed * 65536u);
    let v = f32(h & 255u) / 255.0;
    textureStore(noise, gid.xy, vec4<f32>(v, v * 0.7, 1.0 - v, 1.0));
}
";

fn filters<G: Gpu>() -> Result<Demo<G>, DemoError> {
    let mut table = ResourceTable::new();
    let fixed = ResourceSize::Fixed(NOISE_SIZE, NOISE_SIZE);
    let noise = table.add_texture(TextureDecl::new("noise", fixed, PixelFormat::Rgba8Unorm));
    let blurred = table.add_texture(TextureDecl::new("blurred", fixed, PixelFormat::Rgba8Unorm));
    let seed = Uniform::new(0u32);

    let bake: AsyncGroupHandle<G> = AsyncGroupHandle::new("bake")?;
    let scheduler = bake.clone();
    let callback_seed = seed.clone();

    let program = Program::new(LIBRARY)
        .with(ManualCallback::new("schedule bake", move |info| {
            if scheduler.is_complete() {
                scheduler.set_ready();
            }
            if info.frame % REBAKE_INTERVAL == 0 {
                callback_seed.update(|s| *s = s.wrapping_add(1));
                scheduler.run(());
            }
            Ok(())
        }))
        .with(
            AsyncGroup::new(bake.link()).child(
                Dispatch::new("bake", BAKE)
                    .arg(Argument::write_texture("noise", noise))
                    .arg(Argument::bytes("seed", &seed))
                    .fit_texture("noise"),
            ),
        )
        .with(
            Group::new("show")
                .active_when(bake.completed_once_flag())
                .child(VendorFilter::new(ImageFilter::GaussianBlur { sigma: 2.0 }, noise, blurred))
                .child(present(blurred)),
        );

    let mut demo = Demo::new("filters", program, table);
    demo.async_groups.push(bake);
    Ok(demo)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use kiln_graph::recording::RecordedCommand;
    use kiln_graph::validation::validate_unit;
    use kiln_graph::{compile, CompileOptions, GraphOptions, PassGraph, RecordingGpu, SurfaceInfo};

    fn surface() -> SurfaceInfo {
        SurfaceInfo::new(320, 240, PixelFormat::Bgra8UnormSrgb)
    }

    #[test]
    fn test_every_demo_generates_valid_wgsl() {
        for info in DEMOS {
            let demo = build::<RecordingGpu>(info.name).unwrap();
            let compiled = compile(&demo.program, &demo.resources, &CompileOptions::default()).unwrap();
            for unit in &compiled.units {
                validate_unit(&unit.label, &unit.source)
                    .unwrap_or_else(|e| panic!("demo '{}' unit '{}': {e}", info.name, unit.label));
            }
        }
    }

    #[test]
    fn test_unknown_demo() {
        assert!(matches!(build::<RecordingGpu>("nope"), Err(DemoError::Unknown(name)) if name == "nope"));
    }

    #[test]
    fn test_particles_run_substeps_then_draw() {
        let gpu = Arc::new(RecordingGpu::default());
        let demo = build::<RecordingGpu>("particles").unwrap();
        let (program, table, mut state) = demo.into_parts();
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions { validate: true }).unwrap();
        graph.setup(surface()).unwrap();

        let texture = gpu.surface_texture(surface()).unwrap();
        state.advance(1.0 / 60.0);
        graph.run_frame(Some(&texture), surface()).unwrap();

        let commands = gpu.commands();
        let labels: Vec<&str> = commands.iter().map(|c| c.label()).collect();
        assert_eq!(labels, ["integrate", "integrate", "points"]);
        assert!(matches!(
            &commands[2],
            RecordedCommand::Draw { vertices, .. } if *vertices == PARTICLE_COUNT as u32
        ));
    }

    #[test]
    fn test_filters_show_group_waits_for_first_bake() {
        let gpu = Arc::new(RecordingGpu::default());
        let demo = build::<RecordingGpu>("filters").unwrap();
        let (program, table, state) = demo.into_parts();
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions::default()).unwrap();
        graph.setup(surface()).unwrap();
        let texture = gpu.surface_texture(surface()).unwrap();

        // Frame 0 only schedules the bake; nothing is drawn yet.
        graph.run_frame(Some(&texture), surface()).unwrap();
        assert!(state.settle(Duration::from_secs(5)));
        let baked = gpu.submissions();
        assert_eq!(baked.len(), 1);
        assert_eq!(baked[0].label, "bake (async)");

        graph.run_frame(Some(&texture), surface()).unwrap();
        let labels: Vec<String> = gpu
            .submissions()
            .last()
            .map(|s| s.commands.iter().map(|c| c.label().to_string()).collect())
            .unwrap_or_default();
        assert_eq!(labels, ["gaussian blur", "present"]);
    }
}
