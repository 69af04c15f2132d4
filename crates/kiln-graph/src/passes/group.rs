use kiln_core::{Counter, Flag};

use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::Gpu;
use crate::pass::{Pass, PassError};

/// Ordered children encoded `repeat` times a frame while `active` holds.
/// Both are read once per frame, in `pre_run`.
pub struct GroupPass<G: Gpu> {
    label: String,
    children: Vec<Box<dyn Pass<G>>>,
    repeat: Option<Counter>,
    active: Option<Flag>,
    planned: u32,
}

impl<G: Gpu> GroupPass<G> {
    pub fn new(
        label: impl Into<String>,
        children: Vec<Box<dyn Pass<G>>>,
        repeat: Option<Counter>,
        active: Option<Flag>,
    ) -> Self {
        Self {
            label: label.into(),
            children,
            repeat,
            active,
            planned: 0,
        }
    }

    /// How many times the children run this frame.
    pub fn iterations(&self) -> u32 {
        if self.active.as_ref().is_some_and(|flag| !flag.get()) {
            return 0;
        }
        self.repeat.as_ref().map_or(1, Counter::get)
    }
}

impl<G: Gpu> Pass<G> for GroupPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        for child in &mut self.children {
            child.setup(info)?;
        }
        Ok(())
    }

    fn pre_run(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        // Frozen here so a callback flipping the flag mid-frame cannot encode
        // children that were never prepared.
        self.planned = self.iterations();
        if self.planned == 0 {
            return Ok(());
        }
        for child in &mut self.children {
            child.pre_run(info)?;
        }
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        let iterations = self.planned;
        if iterations == 0 {
            tracing::trace!("group '{}' skipped", self.label);
            return Ok(());
        }
        for _ in 0..iterations {
            for child in &mut self.children {
                child.encode(info)?;
            }
        }
        Ok(())
    }
}
