//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::realtime::RealtimeError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout, signals)
    IoError,
    /// Bad command line value
    InvalidArgument,
    /// Change feed unreachable or failing
    FeedError,
    /// Async runtime could not start
    RuntimeError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "VITALSYNC_CLI_CONFIG_ERROR",
            Self::IoError => "VITALSYNC_CLI_IO_ERROR",
            Self::InvalidArgument => "VITALSYNC_CLI_INVALID_ARGUMENT",
            Self::FeedError => "VITALSYNC_CLI_FEED_ERROR",
            Self::RuntimeError => "VITALSYNC_CLI_RUNTIME_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn feed_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::FeedError, msg)
    }

    pub fn runtime_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::RuntimeError, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<RealtimeError> for CliError {
    fn from(e: RealtimeError) -> Self {
        match e {
            RealtimeError::ConfigError(msg) => Self::config_error(msg),
            RealtimeError::InvalidKey(msg) => Self::invalid_argument(msg),
            other => Self::feed_error(other.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_error_mapping() {
        let err: CliError = RealtimeError::ConfigError("bad window".into()).into();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
        assert_eq!(err.message(), "bad window");

        let err: CliError = RealtimeError::InvalidKey("empty table".into()).into();
        assert_eq!(err.code_str(), "VITALSYNC_CLI_INVALID_ARGUMENT");

        let err: CliError = RealtimeError::ConnectionError("refused".into()).into();
        assert_eq!(err.code(), &CliErrorCode::FeedError);
    }

    #[test]
    fn test_display_includes_code() {
        let err = CliError::runtime_error("no runtime");
        assert_eq!(err.to_string(), "VITALSYNC_CLI_RUNTIME_ERROR: no runtime");
    }
}
