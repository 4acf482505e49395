//! # Change Feed Provider
//!
//! The seam between the registry and whatever serves the change feed.
//! A provider opens one filtered channel per [`ChannelSpec`] and pushes
//! what it receives into the [`ChannelSink`] it was given.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use super::errors::RealtimeResult;
use super::event::{ChangeEvent, ChangeKinds};
use super::key::SubscriptionKey;

/// What a provider channel listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel name, unique per key
    pub name: String,
    /// Database schema
    pub schema: String,
    /// Table name
    pub table: String,
    /// Row filter, e.g. `user_id=eq.u1`
    pub filter: String,
    /// Change kinds to receive
    pub kinds: ChangeKinds,
}

impl ChannelSpec {
    /// Spec for a key, filtered on `user_column`
    pub fn for_key(key: &SubscriptionKey, schema: &str, user_column: &str, kinds: ChangeKinds) -> Self {
        Self {
            name: key.channel_name(),
            schema: schema.to_string(),
            table: key.table().to_string(),
            filter: key.row_filter(user_column),
            kinds,
        }
    }
}

/// Channel status as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Open requested, not yet confirmed
    Joining,
    /// Provider confirmed the subscription
    Subscribed,
    /// Provider reported a failure
    Errored(String),
    /// Provider never confirmed
    TimedOut,
    /// Provider closed the channel
    Closed,
}

impl ChannelStatus {
    /// Whether the channel can no longer deliver events
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Errored(_) | ChannelStatus::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Joining => write!(f, "joining"),
            ChannelStatus::Subscribed => write!(f, "subscribed"),
            ChannelStatus::Errored(reason) => write!(f, "errored: {}", reason),
            ChannelStatus::TimedOut => write!(f, "timed_out"),
            ChannelStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Message pushed by a provider for one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(ChangeEvent),
    Status(ChannelStatus),
}

/// Receiving half of a sink
pub type ChannelReceiver = mpsc::UnboundedReceiver<ChannelMessage>;

/// Where a provider pushes events and status changes for one channel.
///
/// Pushing never blocks. Pushes after the registration is gone are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver draining it
    pub fn channel() -> (Self, ChannelReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Push a change event
    pub fn event(&self, event: ChangeEvent) {
        let _ = self.sender.send(ChannelMessage::Event(event));
    }

    /// Push a status change
    pub fn status(&self, status: ChannelStatus) {
        let _ = self.sender.send(ChannelMessage::Status(status));
    }

    /// Whether the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Provider-side handle of one open channel
pub trait ChannelHandle: Send {
    /// Channel name
    fn name(&self) -> &str;

    /// Release the channel. Best effort: errors are the provider's to log.
    fn close(self: Box<Self>);
}

/// Anything that can serve filtered change feeds
pub trait ChangeFeedProvider: Send + Sync {
    /// Open a channel for `spec`, delivering into `sink`
    fn open(&self, spec: &ChannelSpec, sink: ChannelSink) -> RealtimeResult<Box<dyn ChannelHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::ChangeKind;
    use serde_json::json;

    #[test]
    fn test_spec_for_key() {
        let key = SubscriptionKey::new("lab_results", "u9").unwrap();
        let spec = ChannelSpec::for_key(&key, "public", "owner_id", ChangeKinds::only(ChangeKind::Created));

        assert_eq!(spec.name, "lab_results:u9");
        assert_eq!(spec.table, "lab_results");
        assert_eq!(spec.filter, "owner_id=eq.u9");
        assert!(spec.kinds.contains(ChangeKind::Created));
        assert!(!spec.kinds.contains(ChangeKind::Deleted));
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel();

        sink.status(ChannelStatus::Subscribed);
        sink.event(ChangeEvent::created("lab_results", json!({"id": 1})));

        assert_eq!(rx.recv().await, Some(ChannelMessage::Status(ChannelStatus::Subscribed)));
        match rx.recv().await {
            Some(ChannelMessage::Event(event)) => assert_eq!(event.kind, ChangeKind::Created),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_sink_after_receiver_dropped() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);

        assert!(sink.is_closed());
        sink.status(ChannelStatus::Closed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ChannelStatus::Errored("refused".into())).unwrap();
        assert_eq!(json["state"], "errored");
        assert_eq!(json["reason"], "refused");

        let json = serde_json::to_value(ChannelStatus::Subscribed).unwrap();
        assert_eq!(json["state"], "subscribed");
        assert!(ChannelStatus::TimedOut.is_failure());
        assert!(!ChannelStatus::Joining.is_failure());
    }
}
