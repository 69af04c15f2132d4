use kiln_core::{BufferHandle, PixelFormat, TextureRef};

use crate::compiler::CompiledDraw;
use crate::component::{ColorTarget, DepthTarget, Topology, VertexCount};
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::{
    ColorAttachment, ColorTargetSpec, CommandEncoder, DepthAttachment, DrawCommand, Gpu,
    IndexBinding, IndexFormat, RenderPipelineSpec,
};
use crate::pass::{Bindings, Pass, PassError};

pub struct DrawSetup {
    pub targets: Vec<ColorTarget>,
    pub depth: Option<DepthTarget>,
    pub topology: Topology,
    pub vertices: VertexCount,
    pub instances: u32,
    pub index: Option<(BufferHandle, IndexFormat)>,
}

/// A vertex + fragment pair rendered into colour targets.
pub struct DrawPass<G: Gpu> {
    label: String,
    compiled: CompiledDraw,
    setup: DrawSetup,
    bindings: Bindings<G>,
    pipeline: Option<G::RenderPipeline>,
    /// Target formats the pipeline was built for.
    formats: Vec<PixelFormat>,
}

impl<G: Gpu> DrawPass<G> {
    pub fn new(label: impl Into<String>, compiled: CompiledDraw, setup: DrawSetup) -> Self {
        let label = label.into();
        Self {
            bindings: Bindings::new(&label, compiled.groups.clone(), compiled.bytes.clone()),
            label,
            compiled,
            setup,
            pipeline: None,
            formats: Vec::new(),
        }
    }

    fn target_formats(&self, info: &RenderInfo<'_, G>) -> Result<Vec<PixelFormat>, PassError> {
        let mut formats = Vec::with_capacity(self.setup.targets.len() + 1);
        for target in &self.setup.targets {
            formats.push(match target.texture {
                TextureRef::Surface => info.surface.format,
                TextureRef::Resource(handle) => {
                    info.resources
                        .texture_format(handle)
                        .ok_or_else(|| PassError::MissingTexture {
                            pass: self.label.clone(),
                            handle,
                        })?
                }
            });
        }
        if let Some(depth) = self.setup.depth {
            formats.push(info.resources.texture_format(depth.texture).ok_or_else(|| {
                PassError::MissingTexture {
                    pass: self.label.clone(),
                    handle: depth.texture,
                }
            })?);
        }
        Ok(formats)
    }

    fn build_pipeline(&mut self, info: &RenderInfo<'_, G>, formats: Vec<PixelFormat>) -> Result<(), PassError> {
        let program = info
            .context
            .programs()
            .get(self.compiled.unit.0)
            .ok_or_else(|| PassError::Unbound {
                pass: self.label.clone(),
            })?;
        let groups = info.context.compiled.group_layouts(self.bindings.groups());
        let targets: Vec<ColorTargetSpec> = self
            .setup
            .targets
            .iter()
            .zip(&formats)
            .map(|(target, format)| ColorTargetSpec {
                format: *format,
                blend: target.blend,
            })
            .collect();
        let depth = self
            .setup
            .depth
            .and_then(|_| formats.get(self.setup.targets.len()).copied());
        let pipeline = info
            .gpu()
            .create_render_pipeline(&RenderPipelineSpec {
                label: &self.label,
                program,
                vertex_entry: &self.compiled.vertex_entry,
                fragment_entry: &self.compiled.fragment_entry,
                groups: &groups,
                targets: &targets,
                depth,
                topology: self.setup.topology,
            })
            .map_err(|e| PassError::gpu(&self.label, e))?;
        self.pipeline = Some(pipeline);
        self.formats = formats;
        Ok(())
    }
}

impl<G: Gpu> Pass<G> for DrawPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let formats = self.target_formats(info)?;
        self.build_pipeline(info, formats)?;
        self.bindings.setup(info)
    }

    fn pre_run(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let formats = self.target_formats(info)?;
        if formats != self.formats {
            tracing::debug!("{}: target formats changed, rebuilding pipeline", self.label);
            self.build_pipeline(info, formats)?;
        }
        self.bindings.refresh(info)?;
        self.bindings.upload(info.gpu());
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        let pipeline = self.pipeline.as_ref().ok_or_else(|| PassError::Unbound {
            pass: self.label.clone(),
        })?;
        let resources = info.resources;

        let mut colors = Vec::with_capacity(self.setup.targets.len());
        for target in &self.setup.targets {
            let texture = match target.texture {
                TextureRef::Surface => info.surface.ok_or_else(|| PassError::NoSurface {
                    pass: self.label.clone(),
                })?,
                TextureRef::Resource(handle) => {
                    resources
                        .texture(handle)
                        .ok_or_else(|| PassError::MissingTexture {
                            pass: self.label.clone(),
                            handle,
                        })?
                }
            };
            colors.push(ColorAttachment {
                texture,
                load: target.load,
            });
        }
        let depth = match self.setup.depth {
            Some(depth) => Some(DepthAttachment {
                texture: resources
                    .texture(depth.texture)
                    .ok_or_else(|| PassError::MissingTexture {
                        pass: self.label.clone(),
                        handle: depth.texture,
                    })?,
                clear: depth.clear,
            }),
            None => None,
        };

        let missing = |handle| PassError::MissingBuffer {
            pass: self.label.clone(),
            handle,
        };
        let index = match self.setup.index {
            Some((handle, format)) => Some(IndexBinding {
                buffer: resources.buffer(handle).ok_or_else(|| missing(handle))?,
                format,
                count: resources.buffer_len(handle).ok_or_else(|| missing(handle))? as u32,
            }),
            None => None,
        };
        let vertices = match self.setup.vertices {
            VertexCount::Fixed(count) => count,
            VertexCount::Buffer(handle) => {
                resources.buffer_len(handle).ok_or_else(|| missing(handle))? as u32
            }
        };

        let groups = self.bindings.bound()?;
        info.stream
            .encoder()
            .and_then(|encoder| {
                encoder.draw(&DrawCommand {
                    label: &self.label,
                    pipeline,
                    groups: &groups,
                    colors: &colors,
                    depth,
                    vertices,
                    instances: self.setup.instances,
                    index,
                })
            })
            .map_err(|e| PassError::gpu(&self.label, e))
    }
}
