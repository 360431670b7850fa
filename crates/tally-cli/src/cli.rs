//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Event-to-interval time accounting.
///
/// Reduces raw activity events into tagged ledger intervals, keeps the
/// ledger current with a polling sync loop, and reconciles recorded
/// history against a fresh derivation.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load captured events from JSON Lines files into the event store.
    Import {
        /// Capture files to load.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Reduce stored events into ledger intervals.
    Sync {
        /// Run a single pass instead of polling.
        #[arg(long)]
        once: bool,

        /// Origin for a fresh ledger, ISO 8601 or relative ("2 hours ago").
        #[arg(long)]
        since: Option<String>,
    },

    /// Compare recorded intervals against a fresh derivation.
    Diff {
        /// Start of the window, ISO 8601 or relative.
        #[arg(long)]
        start: String,

        /// End of the window, ISO 8601 or relative.
        #[arg(long)]
        end: String,

        /// Write the proposed corrections back to the ledger.
        #[arg(long)]
        apply: bool,
    },

    /// Check the configuration for inconsistencies.
    Validate,

    /// Show store freshness and current tracking status.
    Status,
}
