use kiln_core::{Extent, TextureRef};

use crate::component::BlitOp;
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::{CommandEncoder, Gpu};
use crate::pass::{Pass, PassError};

/// Copies and clears.
pub struct BlitPass {
    label: String,
    op: BlitOp,
}

impl BlitPass {
    pub fn new(label: impl Into<String>, op: BlitOp) -> Self {
        Self {
            label: label.into(),
            op,
        }
    }
}

fn overlap(a: Extent, b: Extent) -> Extent {
    Extent::new(a.width.min(b.width), a.height.min(b.height), a.depth.min(b.depth))
}

impl<G: Gpu> Pass<G> for BlitPass {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, _info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        let resources = info.resources;
        let missing_texture = |handle| PassError::MissingTexture {
            pass: self.label.clone(),
            handle,
        };
        let missing_buffer = |handle| PassError::MissingBuffer {
            pass: self.label.clone(),
            handle,
        };

        let result = match self.op {
            BlitOp::CopyTexture {
                source,
                destination,
            } => {
                let src = resources.texture(source).ok_or_else(|| missing_texture(source))?;
                let src_extent = resources
                    .texture_extent(source)
                    .ok_or_else(|| missing_texture(source))?;
                let (dst, dst_extent) = match destination {
                    TextureRef::Surface => (
                        info.surface.ok_or_else(|| PassError::NoSurface {
                            pass: self.label.clone(),
                        })?,
                        info.surface_info.extent,
                    ),
                    TextureRef::Resource(handle) => (
                        resources.texture(handle).ok_or_else(|| missing_texture(handle))?,
                        resources
                            .texture_extent(handle)
                            .ok_or_else(|| missing_texture(handle))?,
                    ),
                };
                info.stream
                    .encoder()
                    .and_then(|e| e.copy_texture(src, dst, overlap(src_extent, dst_extent)))
            }
            BlitOp::CopyBuffer {
                source,
                destination,
            } => {
                let src = resources.buffer(source).ok_or_else(|| missing_buffer(source))?;
                let dst = resources
                    .buffer(destination)
                    .ok_or_else(|| missing_buffer(destination))?;
                let size = resources
                    .buffer_size(source)
                    .zip(resources.buffer_size(destination))
                    .map(|(a, b)| a.min(b))
                    .unwrap_or(0);
                info.stream
                    .encoder()
                    .and_then(|e| e.copy_buffer(src, dst, size))
            }
            BlitOp::ClearBuffer(handle) => {
                let buffer = resources.buffer(handle).ok_or_else(|| missing_buffer(handle))?;
                info.stream.encoder().and_then(|e| e.clear_buffer(buffer))
            }
        };
        result.map_err(|e| PassError::gpu(&self.label, e))
    }
}
