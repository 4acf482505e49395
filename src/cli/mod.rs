//! CLI module for vitalsync
//!
//! Provides command-line interface for:
//! - check-config: Validate and print a configuration file
//! - watch: Stream one user's coalesced table changes as JSON lines

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, watch};
pub use errors::{CliError, CliErrorCode, CliResult};
