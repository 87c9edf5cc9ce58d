//! scopesync CLI
//!
//! Command-line tools for exercising and debugging scopesync.
//!
//! # Commands
//!
//! - `simulate` - Synchronize an in-process server and client and report
//! - `inspect-batch` - List batch parts staged in a replica directory

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// scopesync command-line tools.
#[derive(Parser)]
#[command(name = "scopesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a replica directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two synchronizations between an in-process server and client
    Simulate {
        /// Rows seeded on the server
        #[arg(short, long, default_value = "100")]
        rows: usize,

        /// Maximum rows per batch part
        #[arg(long, default_value = "25")]
        rows_per_part: usize,

        /// Rows edited on both sides between the two synchronizations
        #[arg(short, long, default_value = "5")]
        conflicts: usize,

        /// Serve new clients from a server snapshot
        #[arg(short, long)]
        snapshot: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List batch parts staged in a replica directory
    InspectBatch {
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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            rows,
            rows_per_part,
            conflicts,
            snapshot,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                rows,
                rows_per_part,
                conflicts,
                snapshot,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::InspectBatch { format } => {
            let path = cli.path.ok_or("Replica path required for inspect-batch")?;
            commands::inspect_batch::run(&path, &format)?;
        }
        Commands::Version => {
            println!("scopesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("scopesync Core v{}", scopesync_core::VERSION);
        }
    }

    Ok(())
}
