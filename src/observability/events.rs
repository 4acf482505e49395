//! Observable realtime events
//!
//! Every log line written by the realtime layer names one of these.

use std::fmt;

use super::logger::Severity;

/// Observable events in the realtime layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Configuration loaded
    ConfigLoaded,

    // Provider connection
    /// Connected to the hosted change feed
    FeedConnected,
    /// Hosted change feed connection lost
    FeedDisconnected,
    /// Heartbeat sent on the feed connection
    FeedHeartbeat,
    /// Unparseable frame from the feed
    FeedInvalidMessage,

    // Channel lifecycle
    /// Provider channel opened for a key
    ChannelOpen,
    /// Provider channel failed to open
    ChannelOpenFailed,
    /// Provider channel closed
    ChannelClose,
    /// Provider reported a channel status change
    ChannelStatus,
    /// Provider reported a channel failure
    ChannelError,

    // Listener lifecycle
    /// Listener added to a registration
    ListenerAdded,
    /// Listener removed from a registration
    ListenerRemoved,
    /// Subscriber asked for kinds the channel does not carry
    ListenerKindsNarrowed,

    // Event path
    /// Provider event received for a key
    EventReceived,
    /// A pending event was replaced by a newer one
    EventCoalesced,
    /// Coalesced event delivered to listeners
    EventDelivered,
    /// Listener returned an error or panicked
    ListenerFailed,

    // Registry
    /// Full registry teardown
    RegistryCleanup,
    /// Periodic stats snapshot
    RealtimeStats,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::FeedConnected => "FEED_CONNECTED",
            Event::FeedDisconnected => "FEED_DISCONNECTED",
            Event::FeedHeartbeat => "FEED_HEARTBEAT",
            Event::FeedInvalidMessage => "FEED_INVALID_MESSAGE",

            Event::ChannelOpen => "CHANNEL_OPEN",
            Event::ChannelOpenFailed => "CHANNEL_OPEN_FAILED",
            Event::ChannelClose => "CHANNEL_CLOSE",
            Event::ChannelStatus => "CHANNEL_STATUS",
            Event::ChannelError => "CHANNEL_ERROR",

            Event::ListenerAdded => "LISTENER_ADDED",
            Event::ListenerRemoved => "LISTENER_REMOVED",
            Event::ListenerKindsNarrowed => "LISTENER_KINDS_NARROWED",

            Event::EventReceived => "EVENT_RECEIVED",
            Event::EventCoalesced => "EVENT_COALESCED",
            Event::EventDelivered => "EVENT_DELIVERED",
            Event::ListenerFailed => "LISTENER_FAILED",

            Event::RegistryCleanup => "REGISTRY_CLEANUP",
            Event::RealtimeStats => "REALTIME_STATS",
        }
    }

    /// Default severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::FeedHeartbeat
            | Event::EventReceived
            | Event::EventCoalesced
            | Event::EventDelivered
            | Event::ListenerAdded
            | Event::ListenerRemoved => Severity::Trace,
            Event::FeedDisconnected | Event::FeedInvalidMessage | Event::ListenerKindsNarrowed => {
                Severity::Warn
            }
            Event::ChannelOpenFailed | Event::ChannelError | Event::ListenerFailed => {
                Severity::Error
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
