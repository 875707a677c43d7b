//! graphsync CLI
//!
//! Command-line tools for debugging graphsync traffic.
//!
//! # Commands
//!
//! - `replay` - Run a recorded message trace through ingress and merge
//! - `inspect` - Decode a captured wire frame
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// graphsync command-line tools.
#[derive(Parser)]
#[command(name = "graphsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines message trace and print the resulting replica
    Replay {
        /// Trace file; one message per line, a blank line ends a batch
        trace: PathBuf,

        /// Send every frame lz4-compressed
        #[arg(short, long)]
        compress: bool,

        /// Include the full graph in the output
        #[arg(short, long)]
        graph: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a CBOR frame file
    Inspect {
        /// Frame file
        frame: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            trace,
            compress,
            graph,
            format,
        } => {
            commands::replay::run(&trace, compress, graph, &format)?;
        }
        Commands::Inspect { frame, format } => {
            commands::inspect::run(&frame, &format)?;
        }
        Commands::Version => {
            println!("graphsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("graphsync engine v{}", graphsync_engine::VERSION);
        }
    }

    Ok(())
}
