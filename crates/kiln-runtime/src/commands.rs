//! The offline subcommands: `compile`, `headless` and `demos`.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{CompileError, DeviceCaps, PixelFormat};
use kiln_graph::recording::RecordedSubmission;
use kiln_graph::validation::{validate_unit, ValidationError};
use kiln_graph::{compile, CompileOptions, GpuError, GraphError, GraphOptions, PassGraph, RecordingGpu, SurfaceInfo};
use thiserror::Error;

use crate::config::KilnConfig;
use crate::demos::{self, DemoError};

/// Simulated frame time of headless runs.
const HEADLESS_DT: f32 = 1.0 / 60.0;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Demo(#[from] DemoError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

pub fn list_demos() -> String {
    let width = demos::DEMOS.iter().map(|d| d.name.len()).max().unwrap_or(0);
    demos::DEMOS
        .iter()
        .map(|d| format!("  {:width$}  {}\n", d.name, d.summary))
        .collect()
}

/// Generated WGSL of every unit of `demo`, one header line per unit.
pub fn compile_demo(demo: &str, validate: bool) -> Result<String, CommandError> {
    let demo = demos::build::<RecordingGpu>(demo)?;
    let compiled = compile(&demo.program, &demo.resources, &CompileOptions::default())?;
    let mut output = String::new();
    for unit in &compiled.units {
        if validate {
            validate_unit(&unit.label, &unit.source)?;
        }
        output.push_str(&format!(
            "// ---- unit '{}': {} ----\n{}\n",
            unit.label,
            unit.entries.join(", "),
            unit.source
        ));
    }
    Ok(output)
}

/// Run `frames` frames of `demo` on the recording backend and describe
/// every submission.
pub fn headless(demo: &str, frames: u32, config: &KilnConfig, validate: bool) -> Result<String, CommandError> {
    let gpu = Arc::new(RecordingGpu::new(DeviceCaps::default()));
    let (program, table, mut state) = demos::build::<RecordingGpu>(demo)?.into_parts();
    let mut graph = PassGraph::build(Arc::clone(&gpu), program, table, GraphOptions { validate })?;

    let surface = SurfaceInfo::new(config.window.width, config.window.height, PixelFormat::Bgra8UnormSrgb);
    graph.setup(surface)?;
    let texture = gpu.surface_texture(surface)?;

    for _ in 0..frames {
        state.advance(HEADLESS_DT);
        graph.run_frame(Some(&texture), surface)?;
    }
    if !state.settle(SETTLE_TIMEOUT) {
        tracing::warn!("async work of '{}' still running after {:?}", state.name, SETTLE_TIMEOUT);
    }

    let submissions = gpu.submissions();
    let mut output = String::new();
    for submission in &submissions {
        output.push_str(&describe(submission));
    }
    output.push_str(&format!(
        "{} frames, {} submissions, {} uploads\n",
        frames,
        submissions.len(),
        gpu.writes().len()
    ));
    Ok(output)
}

fn describe(submission: &RecordedSubmission) -> String {
    let commands: Vec<&str> = submission.commands.iter().map(|c| c.label()).collect();
    format!("#{} {}: {}\n", submission.index, submission.label, commands.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_names_every_demo() {
        let listing = list_demos();
        for demo in demos::DEMOS {
            assert!(listing.contains(demo.name));
        }
        assert_eq!(listing.lines().count(), demos::DEMOS.len());
    }

    #[test]
    fn test_compile_prints_unit_headers() {
        let output = compile_demo("gradient", true).unwrap();
        assert!(output.starts_with("// ---- unit 'main': shade, present_vs, present_fs ----"));
        assert!(output.contains("@compute @workgroup_size(8, 8, 1)"));
    }

    #[test]
    fn test_headless_summary() {
        let config = KilnConfig::default();
        let output = headless("gradient", 2, &config, true).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(": shade, present"));
        assert!(lines[2].starts_with("2 frames, 2 submissions"));
    }

    #[test]
    fn test_unknown_demo_is_an_error() {
        assert!(matches!(
            compile_demo("nope", false),
            Err(CommandError::Demo(DemoError::Unknown(_)))
        ));
    }
}
