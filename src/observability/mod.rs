//! Observability for the realtime layer
//!
//! - Structured logging (one JSON object per line)
//! - Typed lifecycle events
//! - Lock-free counters
//!
//! Observability is read-only: nothing here can fail the caller.
//!
//! ```ignore
//! use vitalsync::observability::{log_event, Event};
//!
//! log_event(Event::ChannelOpen, &[("channel", "medical_analyses:u1")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity, LOG_LEVEL_ENV};
pub use metrics::{MetricsSnapshot, RealtimeMetrics};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_does_not_panic() {
        log_event(Event::RegistryCleanup, &[]);
        log_event(Event::ListenerFailed, &[("channel", "profiles:u1"), ("reason", "boom")]);
    }
}
