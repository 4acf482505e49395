//! # Realtime Subscriptions
//!
//! Shared per-user change channels for the app's views.
//!
//! ## Architecture
//!
//! - **Registry**: one channel per (table, user), many listeners on it
//! - **Coalescer**: bursts of changes collapse into one delivery per window
//! - **Provider**: the change feed behind the channels (hosted or in-memory)
//! - **Monitor**: periodic stats for operators
//!
//! A view subscribes with a [`SubscriptionKey`] and gets back an
//! [`Unsubscribe`] handle. The first subscriber for a key opens the channel;
//! the last one to leave closes it.

pub mod coalescer;
pub mod errors;
pub mod event;
pub mod key;
pub mod memory;
pub mod monitor;
pub mod phoenix;
pub mod provider;
pub mod registry;

pub use coalescer::{Coalescer, CoalescerState, PendingEvents};
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{ChangeEvent, ChangeKind, ChangeKinds, RowPayload};
pub use key::SubscriptionKey;
pub use memory::InMemoryFeed;
pub use monitor::StatsMonitor;
pub use phoenix::{PhoenixFeed, PhoenixMessage};
pub use provider::{
    ChangeFeedProvider, ChannelHandle, ChannelMessage, ChannelSink, ChannelSpec, ChannelStatus,
};
pub use registry::{
    ChannelStats, ErrorObserver, EventHandler, ListenerId, ListenerResult, RealtimeRegistry,
    RegistryStats, Unsubscribe,
};
