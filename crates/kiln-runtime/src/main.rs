mod cli;
mod commands;
mod config;
mod demos;
mod driver;

use clap::Parser;
use cli::{CliArgs, Command};
use kiln_graph::GraphOptions;

fn main() {
    let args = CliArgs::parse();

    // Config comes first so its log filter can seed the subscriber.
    let (config, config_path) = match config::resolve(args.config.as_deref()) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let filter = args.log.clone().unwrap_or_else(|| config.log.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    tracing::info!("kiln v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        tracing::info!("loaded config {}", path.display());
    }

    let validate = config.validate && !args.no_validate;
    let demo = args
        .command
        .demo()
        .unwrap_or(config.default_demo.as_str())
        .to_string();

    let result = match &args.command {
        // kiln run [--demo X]
        Command::Run { .. } => driver::run(demo, config.window.clone(), GraphOptions { validate })
            .map_err(|e| e.to_string()),

        // kiln compile [--demo X]
        Command::Compile { .. } => commands::compile_demo(&demo, validate)
            .map(|wgsl| print!("{wgsl}"))
            .map_err(|e| e.to_string()),

        // kiln headless [--demo X] [--frames N]
        Command::Headless { frames, .. } => commands::headless(&demo, *frames, &config, validate)
            .map(|summary| print!("{summary}"))
            .map_err(|e| e.to_string()),

        // kiln demos
        Command::Demos => {
            print!("{}", commands::list_demos());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
