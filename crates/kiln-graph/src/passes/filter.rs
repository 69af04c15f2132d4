use kiln_core::TextureHandle;

use crate::filters::ImageFilter;
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::{CommandEncoder, Gpu};
use crate::pass::{Pass, PassError};

/// A pre-built image filter from one texture into another.
pub struct FilterPass<G: Gpu> {
    label: String,
    filter: ImageFilter,
    source: TextureHandle,
    destination: TextureHandle,
    prepared: Option<G::Filter>,
}

impl<G: Gpu> FilterPass<G> {
    pub fn new(
        label: impl Into<String>,
        filter: ImageFilter,
        source: TextureHandle,
        destination: TextureHandle,
    ) -> Self {
        Self {
            label: label.into(),
            filter,
            source,
            destination,
            prepared: None,
        }
    }

    fn missing(&self, handle: TextureHandle) -> PassError {
        PassError::MissingTexture {
            pass: self.label.clone(),
            handle,
        }
    }
}

impl<G: Gpu> Pass<G> for FilterPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let format = info
            .resources
            .texture_format(self.destination)
            .ok_or_else(|| self.missing(self.destination))?;
        let prepared = info
            .gpu()
            .create_filter(&self.filter, format)
            .map_err(|e| PassError::gpu(&self.label, e))?;
        self.prepared = Some(prepared);
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        let filter = self.prepared.as_ref().ok_or_else(|| PassError::Unbound {
            pass: self.label.clone(),
        })?;
        let source = info
            .resources
            .texture(self.source)
            .ok_or_else(|| self.missing(self.source))?;
        let destination = info
            .resources
            .texture(self.destination)
            .ok_or_else(|| self.missing(self.destination))?;
        let extent = info
            .resources
            .texture_extent(self.destination)
            .ok_or_else(|| self.missing(self.destination))?;
        info.stream
            .encoder()
            .and_then(|e| e.apply_filter(filter, source, destination, extent))
            .map_err(|e| PassError::gpu(&self.label, e))
    }
}
