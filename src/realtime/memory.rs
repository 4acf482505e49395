//! # In-Memory Change Feed
//!
//! A provider that lives inside the process. Rows published to it are
//! routed to every open channel whose table, kinds and row filter match.
//! Used for tests and for running the views without the hosted feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::ChangeEvent;
use super::provider::{ChangeFeedProvider, ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus};

#[derive(Debug)]
struct OpenChannel {
    spec: ChannelSpec,
    sink: ChannelSink,
}

#[derive(Debug, Default)]
struct FeedState {
    channels: RwLock<HashMap<String, OpenChannel>>,
    opened: AtomicU64,
    closed: AtomicU64,
    fail_next_open: Mutex<Option<String>>,
}

/// In-process change feed
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeed {
    state: Arc<FeedState>,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail with `reason`
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.state.fail_next_open.lock() {
            *slot = Some(reason.into());
        }
    }

    /// Publish a change. Returns the number of channels it was routed to.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let Ok(channels) = self.state.channels.read() else {
            return 0;
        };

        let mut routed = 0;
        for channel in channels.values() {
            if channel.spec.table == event.table
                && channel.spec.kinds.contains(event.kind)
                && filter_matches(&channel.spec.filter, event)
            {
                channel.sink.event(event.clone());
                routed += 1;
            }
        }
        routed
    }

    /// Push a status change to a named channel. Returns false if it is not open.
    pub fn set_status(&self, channel: &str, status: ChannelStatus) -> bool {
        match self.state.channels.read() {
            Ok(channels) => match channels.get(channel) {
                Some(open) => {
                    open.sink.status(status);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Channels opened so far
    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::Relaxed)
    }

    /// Channels closed so far
    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::Relaxed)
    }

    /// Names of the channels currently open, sorted
    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .channels
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Definition a channel was opened with
    pub fn spec(&self, channel: &str) -> Option<ChannelSpec> {
        self.state
            .channels
            .read()
            .ok()
            .and_then(|c| c.get(channel).map(|open| open.spec.clone()))
    }
}

impl ChangeFeedProvider for InMemoryFeed {
    fn open(&self, spec: &ChannelSpec, sink: ChannelSink) -> RealtimeResult<Box<dyn ChannelHandle>> {
        let failure = self
            .state
            .fail_next_open
            .lock()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?
            .take();
        if let Some(reason) = failure {
            return Err(RealtimeError::ChannelOpenFailed {
                channel: spec.name.clone(),
                reason,
            });
        }

        let mut channels = self
            .state
            .channels
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;

        sink.status(ChannelStatus::Subscribed);
        channels.insert(
            spec.name.clone(),
            OpenChannel {
                spec: spec.clone(),
                sink,
            },
        );
        self.state.opened.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(InMemoryHandle {
            name: spec.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryHandle {
    name: String,
    state: Arc<FeedState>,
}

impl ChannelHandle for InMemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(self: Box<Self>) {
        if let Ok(mut channels) = self.state.channels.write() {
            if channels.remove(&self.name).is_some() {
                self.state.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Evaluate a `column=eq.value` filter against the event's row
fn filter_matches(filter: &str, event: &ChangeEvent) -> bool {
    let Some((column, expected)) = filter.split_once("=eq.") else {
        // Only equality filters are issued by the registry
        return filter.is_empty();
    };

    match event.row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        _ => false,
    }
}
