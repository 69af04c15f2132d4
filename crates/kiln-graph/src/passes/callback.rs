use crate::component::CallbackFn;
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::Gpu;
use crate::pass::{Pass, PassError};

/// Caller code run at encode time.
pub struct CallbackPass<G: Gpu> {
    label: String,
    callback: CallbackFn<G>,
}

impl<G: Gpu> CallbackPass<G> {
    pub fn new(label: impl Into<String>, callback: CallbackFn<G>) -> Self {
        Self {
            label: label.into(),
            callback,
        }
    }
}

impl<G: Gpu> Pass<G> for CallbackPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, _info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        (self.callback)(info)
    }
}
