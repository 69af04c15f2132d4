//! Window driver: owns the surface and runs one pass-graph frame per redraw.

use std::sync::Arc;

use kiln_graph::wgpu_backend::pixel_format;
use kiln_graph::{GpuError, GraphError, GraphOptions, PassGraph, SurfaceInfo, WgpuGpu, WgpuTexture};
use thiserror::Error;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::config::WindowConfig;
use crate::demos::{self, DemoError, DemoState};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("event loop: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
    #[error("window creation failed: {0}")]
    Window(#[from] winit::error::OsError),
    #[error("surface creation failed: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("surface offers no supported format")]
    NoSurfaceFormat,
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Demo(#[from] DemoError),
}

struct GpuState {
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    info: SurfaceInfo,
    graph: PassGraph<WgpuGpu>,
    demo: DemoState<WgpuGpu>,
}

impl GpuState {
    fn resize(&mut self, gpu: &WgpuGpu, width: u32, height: u32) -> Result<(), GraphError> {
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(gpu.device(), &self.surface_config);
        self.info = SurfaceInfo::new(width, height, self.info.format);
        self.graph.resize(self.info)
    }
}

pub struct App {
    demo: String,
    window_config: WindowConfig,
    options: GraphOptions,
    window: Option<Arc<Window>>,
    gpu: Option<Arc<WgpuGpu>>,
    state: Option<GpuState>,
    last_frame: instant::Instant,
    error: Option<DriverError>,
}

impl App {
    pub fn new(demo: String, window_config: WindowConfig, options: GraphOptions) -> Self {
        Self {
            demo,
            window_config,
            options,
            window: None,
            gpu: None,
            state: None,
            last_frame: instant::Instant::now(),
            error: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<(), DriverError> {
        let attributes = Window::default_attributes()
            .with_title(self.window_config.title.clone())
            .with_inner_size(winit::dpi::LogicalSize::new(
                self.window_config.width,
                self.window_config.height,
            ));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(Arc::clone(&window))?;
        let (adapter, gpu) = pollster::block_on(WgpuGpu::request(&instance, Some(&surface)))?;
        let gpu = Arc::new(gpu);

        let caps = surface.get_capabilities(&adapter);
        let (format, pixel) = caps
            .formats
            .iter()
            .filter(|f| f.is_srgb())
            .chain(caps.formats.iter())
            .find_map(|f| pixel_format(*f).map(|p| (*f, p)))
            .ok_or(DriverError::NoSurfaceFormat)?;

        let size = window.inner_size();
        let surface_config = wgpu::SurfaceConfiguration {
            // Blits may copy straight into the presented texture.
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if self.window_config.vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            desired_maximum_frame_latency: 2,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
        };
        surface.configure(gpu.device(), &surface_config);
        let info = SurfaceInfo::new(surface_config.width, surface_config.height, pixel);
        tracing::info!("surface {}x{} {:?}", info.extent.width, info.extent.height, format);

        let (program, table, demo) = demos::build::<WgpuGpu>(&self.demo)?.into_parts();
        let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, self.options)?;
        graph.setup(info)?;
        tracing::info!("running demo '{}'", demo.name);

        self.state = Some(GpuState {
            surface,
            surface_config,
            info,
            graph,
            demo,
        });
        self.gpu = Some(gpu);
        self.window = Some(window);
        self.last_frame = instant::Instant::now();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: DriverError) {
        tracing::error!("{error}");
        self.error = Some(error);
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<(), DriverError> {
        let (Some(state), Some(gpu)) = (self.state.as_mut(), self.gpu.as_ref()) else {
            return Ok(());
        };

        let now = instant::Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        state.demo.advance(dt);

        let frame = match state.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                let (width, height) = (state.surface_config.width, state.surface_config.height);
                state.resize(gpu, width, height)?;
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("surface error: {e:?}");
                return Ok(());
            }
        };
        let texture = WgpuTexture::from_surface(frame);

        match state.graph.run_frame(Some(&texture), state.info) {
            Ok(_) => texture.present(),
            // A failing pass drops the frame; the next one starts clean.
            Err(GraphError::Pass(e)) => tracing::error!("frame {} dropped: {e}", state.graph.frame()),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("close requested");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    return;
                }
                let (Some(state), Some(gpu)) = (self.state.as_mut(), self.gpu.as_ref()) else {
                    return;
                };
                if let Err(e) = state.resize(gpu, size.width, size.height) {
                    self.fail(event_loop, e.into());
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// Open a window and run `demo` until it is closed.
pub fn run(demo: String, window_config: WindowConfig, options: GraphOptions) -> Result<(), DriverError> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = App::new(demo, window_config, options);
    event_loop.run_app(&mut app)?;
    match app.error.take() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
