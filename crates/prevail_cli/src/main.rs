//! Prevail CLI
//!
//! Command-line tools for Prevail store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display the manifest, journal segments and snapshots
//! - `verify` - Check every journal record and snapshot
//! - `dump-journal` - Print journal entries for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Prevail command-line store tools.
#[derive(Parser)]
#[command(name = "prevail")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store metadata, segments and snapshots
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal and snapshot integrity
    Verify {
        /// Treat a torn segment tail as a failure
        #[arg(long)]
        strict: bool,
    },

    /// Dump journal entries for debugging
    DumpJournal {
        /// First entry id to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Decode command payloads
        #[arg(long)]
        payload: bool,

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
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify { strict } => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, strict)?;
        }
        Commands::DumpJournal {
            from,
            limit,
            payload,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-journal")?;
            commands::dump_journal::run(&path, from, limit, payload, &format)?;
        }
        Commands::Version => {
            println!("Prevail CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Prevail Core v{}", prevail_core::VERSION);
        }
    }

    Ok(())
}
