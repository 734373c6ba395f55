//! flowd — the FlowGrid daemon.
//!
//! Builds a configured job in-process against a local worker and applies
//! live modifications to it:
//! - Execution graph + slot pool
//! - Local task executor (run loops, result partitions)
//! - Modification coordinator
//!
//! # Usage
//!
//! ```text
//! flowd init --name wordcount --output flowgrid.toml
//! flowd modify --config flowgrid.toml --command trigger source map
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_LOG_FILTER: &str = "info,flowd=debug,flowgrid=debug";

#[derive(Parser)]
#[command(
    name = "flowd",
    about = "FlowGrid — live topology modification for dataflow jobs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job and apply one modification to it.
    ///
    /// Commands: pause <role>, resume <role>, trigger <source> <target>,
    /// insert <after-role>, grow <role>, restart <role>, describe.
    Modify {
        /// Path to flowgrid.toml.
        #[arg(short, long, default_value = "flowgrid.toml")]
        config: PathBuf,
        /// Modification to apply.
        #[arg(long)]
        command: String,
        /// Arguments of the modification (operator roles).
        args: Vec<String>,
        /// Output format: text or json.
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Generate a flowgrid.toml scaffold for a two-stage job.
    Init {
        #[arg(short, long)]
        name: String,
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Modify {
            config,
            command,
            args,
            format,
        } => commands::modify::run(&config, &command, args, format).await,
        Commands::Init { name, output } => commands::init::init(&name, output.as_deref()),
    }
}
