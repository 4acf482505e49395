//! CLI argument definitions using clap
//!
//! Commands:
//! - vitalsync check-config --config <path>
//! - vitalsync watch --config <path> --table <t> --user <id> [--events <kinds>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vitalsync - realtime change subscriptions for the health app
#[derive(Parser, Debug)]
#[command(name = "vitalsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a configuration file, then print it
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./vitalsync.json")]
        config: PathBuf,
    },

    /// Subscribe to one user's changes on a table and print them
    Watch {
        /// Path to configuration file
        #[arg(long, default_value = "./vitalsync.json")]
        config: PathBuf,

        /// Table to watch
        #[arg(long)]
        table: String,

        /// User whose rows are watched
        #[arg(long)]
        user: String,

        /// Change kinds, e.g. `created,updated` (default: all)
        #[arg(long)]
        events: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
