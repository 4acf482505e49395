//! Realtime counters
//!
//! Counters only, monotonic, reset on process start. Relaxed ordering is
//! enough: readers only ever display the values.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for the realtime registry
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    channel_open_failures: AtomicU64,
    channel_errors: AtomicU64,
    events_received: AtomicU64,
    events_coalesced: AtomicU64,
    deliveries: AtomicU64,
    listener_invocations: AtomicU64,
    listener_failures: AtomicU64,
}

impl RealtimeMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_channels_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_channels_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_channel_open_failures(&self) {
        self.channel_open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_channel_errors(&self) {
        self.channel_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_coalesced(&self) {
        self.events_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// One coalesced event handed to the listeners of a key
    pub fn increment_deliveries(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_listener_invocations(&self, n: u64) {
        self.listener_invocations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_listener_failures(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            channel_open_failures: self.channel_open_failures.load(Ordering::Relaxed),
            channel_errors: self.channel_errors.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_coalesced: self.events_coalesced.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            listener_invocations: self.listener_invocations.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`RealtimeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub channel_open_failures: u64,
    pub channel_errors: u64,
    pub events_received: u64,
    pub events_coalesced: u64,
    pub deliveries: u64,
    pub listener_invocations: u64,
    pub listener_failures: u64,
}
