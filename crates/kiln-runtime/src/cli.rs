use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "kiln - compile component trees into GPU frames")]
pub struct CliArgs {
    /// Subcommand (run, compile, headless, demos)
    #[command(subcommand)]
    pub command: Command,

    /// Path to a kiln.yaml (default: search upwards from the working directory)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Log filter, e.g. "debug" or "kiln_graph=trace" (RUST_LOG wins)
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Skip naga validation of generated WGSL
    #[arg(long, global = true)]
    pub no_validate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a window and drive a demo graph every frame
    Run {
        /// Demo to run (default from kiln.yaml)
        #[arg(long)]
        demo: Option<String>,
    },
    /// Print the WGSL generated for a demo
    Compile {
        #[arg(long)]
        demo: Option<String>,
    },
    /// Run frames on the recording backend and print what was submitted
    Headless {
        #[arg(long)]
        demo: Option<String>,

        /// Number of frames to encode
        #[arg(long, default_value_t = 3)]
        frames: u32,
    },
    /// List the bundled demos
    Demos,
}

impl Command {
    pub fn demo(&self) -> Option<&str> {
        match self {
            Self::Run { demo } | Self::Compile { demo } | Self::Headless { demo, .. } => {
                demo.as_deref()
            }
            Self::Demos => None,
        }
    }
}
