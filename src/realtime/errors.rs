//! # Realtime Errors
//!
//! Error types for the realtime module.

use thiserror::Error;

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Realtime errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    // ==================
    // Key Errors
    // ==================
    /// Table name or user id rejected at key construction
    #[error("Invalid subscription key: {0}")]
    InvalidKey(String),

    // ==================
    // Channel Errors
    // ==================
    /// Provider refused or failed to open a channel
    #[error("Failed to open channel {channel}: {reason}")]
    ChannelOpenFailed { channel: String, reason: String },

    /// Provider reported an error on an open channel
    #[error("Channel {channel} error: {reason}")]
    ChannelError { channel: String, reason: String },

    /// Provider never confirmed the join
    #[error("Channel {0} timed out waiting for the provider")]
    ChannelTimeout(String),

    // ==================
    // Listener Errors
    // ==================
    /// A listener returned an error or panicked during delivery
    #[error("Listener on {channel} failed: {reason}")]
    ListenerFailed { channel: String, reason: String },

    // ==================
    // Connection Errors
    // ==================
    /// Feed connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Stable code for logs and observers
    pub fn as_code(&self) -> &'static str {
        match self {
            RealtimeError::InvalidKey(_) => "REALTIME_INVALID_KEY",
            RealtimeError::ChannelOpenFailed { .. } => "REALTIME_CHANNEL_OPEN_FAILED",
            RealtimeError::ChannelError { .. } => "REALTIME_CHANNEL_ERROR",
            RealtimeError::ChannelTimeout(_) => "REALTIME_CHANNEL_TIMEOUT",
            RealtimeError::ListenerFailed { .. } => "REALTIME_LISTENER_FAILED",
            RealtimeError::ConnectionError(_) => "REALTIME_CONNECTION_ERROR",
            RealtimeError::InvalidMessage(_) => "REALTIME_INVALID_MESSAGE",
            RealtimeError::ConfigError(_) => "REALTIME_CONFIG_ERROR",
            RealtimeError::Internal(_) => "REALTIME_INTERNAL",
        }
    }

    /// Whether the error concerns a provider channel rather than a caller
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            RealtimeError::ChannelOpenFailed { .. }
                | RealtimeError::ChannelError { .. }
                | RealtimeError::ChannelTimeout(_)
                | RealtimeError::ConnectionError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RealtimeError::InvalidKey("empty table".into()).as_code(),
            "REALTIME_INVALID_KEY"
        );
        assert_eq!(
            RealtimeError::ChannelTimeout("profiles:u1".into()).as_code(),
            "REALTIME_CHANNEL_TIMEOUT"
        );
    }

    #[test]
    fn test_channel_failure_classification() {
        let open = RealtimeError::ChannelOpenFailed {
            channel: "profiles:u1".into(),
            reason: "refused".into(),
        };
        assert!(open.is_channel_failure());

        let listener = RealtimeError::ListenerFailed {
            channel: "profiles:u1".into(),
            reason: "boom".into(),
        };
        assert!(!listener.is_channel_failure());
    }

    #[test]
    fn test_display() {
        let err = RealtimeError::ChannelError {
            channel: "medical_analyses:u1".into(),
            reason: "socket closed".into(),
        };
        assert_eq!(err.to_string(), "Channel medical_analyses_u1 error: socket closed");
    }
}
