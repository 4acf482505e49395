//! vitalsync - realtime change subscriptions for a health app
//!
//! Views subscribe to one user's rows of one table and are told, at most
//! once per debounce window, that something changed. Subscriptions for the
//! same (table, user) share a single change-feed channel.
//!
//! - [`realtime`]: registry, coalescing, change-feed providers, monitor
//! - [`config`]: JSON configuration
//! - [`observability`]: structured logs and counters
//! - [`cli`]: the `vitalsync` binary

pub mod cli;
pub mod config;
pub mod observability;
pub mod realtime;
