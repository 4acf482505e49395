//! JSON line output for the CLI
//!
//! Every line written to stdout is one JSON object with a `type` field.

use std::io::{self, Write};

use serde_json::{json, Value};

use crate::realtime::{ChangeEvent, RegistryStats};

use super::errors::CliResult;

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_line(&json!({
        "status": "ok",
        "data": data
    }))
}

/// Write one delivered change
pub fn write_event(event: &ChangeEvent) -> CliResult<()> {
    write_line(&json!({
        "type": "event",
        "event": serde_json::to_value(event)?
    }))
}

/// Write one stats snapshot
pub fn write_stats(stats: &RegistryStats) -> CliResult<()> {
    write_line(&json!({
        "type": "stats",
        "stats": serde_json::to_value(stats)?
    }))
}

/// Write an error line to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_line(&json!({
        "type": "error",
        "code": code,
        "message": message
    }))
}

fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
