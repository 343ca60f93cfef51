//! FieldSync CLI
//!
//! Command-line maintenance tools for a FieldSync store directory.
//!
//! # Commands
//!
//! - `submit` - Durably enqueue an operation for a device
//! - `status` - Show the pending-sync report for one or all devices
//! - `escalations` - List conflicts waiting for manual review
//! - `compact` - Remove settled records from the store's journal
//! - `dump-journal` - Dump raw journal frames for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FieldSync command-line store tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Durably enqueue an operation for a device
    Submit {
        /// Originating device id (e.g. TECH-7)
        #[arg(short, long)]
        device: String,

        /// Operation type (create_visit, update_visit, create_contract, update_contract)
        #[arg(short = 't', long = "type")]
        op_type: String,

        /// Operation payload as a JSON object
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// Show the pending-sync report
    Status {
        /// Restrict the report to one device
        #[arg(short, long)]
        device: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List conflicts waiting for manual review
    Escalations {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove settled records from the store's journal
    Compact {
        /// Dry run - report what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Dump raw journal frames for debugging
    DumpJournal {
        /// Maximum number of frames to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Submit {
            device,
            op_type,
            payload,
        } => {
            let store = cli.store.ok_or("Store path required for submit")?;
            commands::submit::run(&store, &device, &op_type, &payload)?;
        }
        Commands::Status { device, format } => {
            let store = cli.store.ok_or("Store path required for status")?;
            commands::status::run(&store, device.as_deref(), &format)?;
        }
        Commands::Escalations { format } => {
            let store = cli.store.ok_or("Store path required for escalations")?;
            commands::escalations::run(&store, &format)?;
        }
        Commands::Compact { dry_run } => {
            let store = cli.store.ok_or("Store path required for compact")?;
            commands::compact::run(&store, dry_run)?;
        }
        Commands::DumpJournal { limit, format } => {
            let store = cli.store.ok_or("Store path required for dump-journal")?;
            commands::dump_journal::run(&store, limit, &format)?;
        }
        Commands::Version => {
            println!("FieldSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
