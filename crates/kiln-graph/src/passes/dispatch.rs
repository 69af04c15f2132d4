use kiln_core::grid::PlannedSource;
use kiln_core::Extent;

use crate::compiler::CompiledDispatch;
use crate::frame::{PassInfo, RenderInfo};
use crate::gpu::{CommandEncoder, ComputePipelineSpec, DispatchCommand, DispatchSize, Gpu};
use crate::pass::{Bindings, Pass, PassError};

/// A compute kernel over a thread grid.
pub struct DispatchPass<G: Gpu> {
    label: String,
    compiled: CompiledDispatch,
    bindings: Bindings<G>,
    pipeline: Option<G::ComputePipeline>,
    wait_until_completed: bool,
    grid: [u32; 3],
}

impl<G: Gpu> DispatchPass<G> {
    pub fn new(label: impl Into<String>, compiled: CompiledDispatch, wait_until_completed: bool) -> Self {
        let label = label.into();
        Self {
            bindings: Bindings::new(&label, compiled.groups.clone(), compiled.bytes.clone()),
            label,
            compiled,
            pipeline: None,
            wait_until_completed,
            grid: [0; 3],
        }
    }

    /// The grid this frame, from the planned source.
    fn grid_extent(&self, info: &RenderInfo<'_, G>) -> Result<[u32; 3], PassError> {
        let plan = &self.compiled.grid;
        let source = match &plan.source {
            PlannedSource::Fixed(extent) => *extent,
            PlannedSource::Dynamic(size) => Extent::from(size()),
            PlannedSource::Texture(handle) => {
                info.resources
                    .texture_extent(*handle)
                    .ok_or_else(|| PassError::MissingTexture {
                        pass: self.label.clone(),
                        handle: *handle,
                    })?
            }
            PlannedSource::Buffer(handle) => {
                let count = info
                    .resources
                    .buffer_len(*handle)
                    .ok_or_else(|| PassError::MissingBuffer {
                        pass: self.label.clone(),
                        handle: *handle,
                    })?;
                Extent::from(u32::try_from(count).unwrap_or(u32::MAX))
            }
            PlannedSource::Surface => info.surface.extent,
        };
        Ok(plan.extent(source))
    }
}

impl<G: Gpu> Pass<G> for DispatchPass<G> {
    fn label(&self) -> &str {
        &self.label
    }

    fn setup(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        let program = info
            .context
            .programs()
            .get(self.compiled.unit.0)
            .ok_or_else(|| PassError::Unbound {
                pass: self.label.clone(),
            })?;
        let groups = info.context.compiled.group_layouts(self.bindings.groups());
        let pipeline = info
            .gpu()
            .create_compute_pipeline(&ComputePipelineSpec {
                label: &self.label,
                program,
                entry: &self.compiled.entry,
                groups: &groups,
            })
            .map_err(|e| PassError::gpu(&self.label, e))?;
        self.pipeline = Some(pipeline);
        self.bindings.setup(info)
    }

    fn pre_run(&mut self, info: &RenderInfo<'_, G>) -> Result<(), PassError> {
        self.bindings.refresh(info)?;
        self.grid = self.grid_extent(info)?;
        self.bindings.upload(info.gpu());
        self.bindings
            .write_grid(info.gpu(), &self.compiled.grid.extent_bytes(self.grid));
        Ok(())
    }

    fn encode(&mut self, info: &mut PassInfo<'_, G>) -> Result<(), PassError> {
        if self.grid.contains(&0) {
            tracing::trace!("{}: empty grid, skipped", self.label);
            return Ok(());
        }
        let pipeline = self.pipeline.as_ref().ok_or_else(|| PassError::Unbound {
            pass: self.label.clone(),
        })?;
        let plan = &self.compiled.grid;
        let size = if plan.exact_threads {
            DispatchSize::Threads {
                threads: self.grid,
                workgroup: plan.workgroup,
            }
        } else {
            DispatchSize::Workgroups(plan.workgroups(self.grid))
        };
        let groups = self.bindings.bound()?;
        info.stream
            .encoder()
            .and_then(|encoder| {
                encoder.dispatch(&DispatchCommand {
                    label: &self.label,
                    pipeline,
                    groups: &groups,
                    size,
                })
            })
            .map_err(|e| PassError::gpu(&self.label, e))?;

        if self.wait_until_completed {
            tracing::trace!("{}: dispatch and wait", self.label);
            info.stream
                .commit_and_wait()
                .map_err(|e| PassError::gpu(&self.label, e))?;
        }
        Ok(())
    }
}
