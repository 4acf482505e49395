//! vitalsync CLI entry point
//!
//! Parses arguments and dispatches to [`cli::run`]. Errors go to stderr and
//! end the process with a non-zero exit code.

use vitalsync::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
