//! # Realtime Subscription Registry
//!
//! Multiplexes logical subscriptions onto provider channels.
//!
//! ## Invariants
//! - At most one provider channel per [`SubscriptionKey`].
//! - A registration exists iff it has at least one listener.
//! - Debounce timers are per key; a new event restarts only its own key's timer.
//! - Listener callbacks never run while the registry lock is held.
//!
//! ## Delivery path
//! provider → [`ChannelSink`] → per-key pump task → [`Coalescer::on_event`]
//! → timer at `now + window` → [`Coalescer::on_timer`] → listeners, in
//! registration order, each given the newest pending event of a kind it
//! asked for.
//!
//! Nothing here returns an error to the subscriber: provider and listener
//! failures are logged, counted and handed to the optional [`ErrorObserver`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RealtimeConfig;
use crate::observability::{log_event, Event, MetricsSnapshot, RealtimeMetrics};

use super::coalescer::{Coalescer, PendingEvents};
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{ChangeEvent, ChangeKinds};
use super::key::SubscriptionKey;
use super::provider::{
    ChangeFeedProvider, ChannelHandle, ChannelMessage, ChannelReceiver, ChannelSink, ChannelSpec,
    ChannelStatus,
};

/// What a listener returns; `Err` is logged and reported, never propagated
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Listener callback
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) -> ListenerResult + Send + Sync>;

/// Opt-in observer for failures affecting one subscription
pub type ErrorObserver = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Process-unique listener identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    kinds: ChangeKinds,
    handler: EventHandler,
    observer: Option<ErrorObserver>,
}

/// One key's provider channel and everything hanging off it
struct Registration {
    epoch: u64,
    channel_name: String,
    kinds: ChangeKinds,
    handle: Option<Box<dyn ChannelHandle>>,
    status: ChannelStatus,
    listeners: Vec<Listener>,
    coalescer: Coalescer,
    timer: Option<(u64, JoinHandle<()>)>,
    pump: Option<JoinHandle<()>>,
}

struct RegistryInner {
    provider: Arc<dyn ChangeFeedProvider>,
    debounce_window: Duration,
    schema: String,
    user_column: String,
    runtime: Handle,
    registrations: Mutex<HashMap<SubscriptionKey, Registration>>,
    next_epoch: AtomicU64,
    next_listener: AtomicU64,
    metrics: RealtimeMetrics,
}

/// Per-channel line of [`RegistryStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub table: String,
    pub user_id: String,
    pub listener_count: usize,
    pub status: ChannelStatus,
    pub pending_delivery: bool,
}

/// Introspection snapshot for the monitor view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_channel_count: usize,
    pub total_listener_count: usize,
    /// Open channels, sorted by name
    pub channels: Vec<ChannelStats>,
}

impl RegistryStats {
    /// Names of the open channels
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Realtime subscription registry.
///
/// Constructed once by the composition root and passed to consumers.
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct RealtimeRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for RealtimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeRegistry")
            .field("debounce_window", &self.inner.debounce_window)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RealtimeRegistry {
    /// Create a registry on the current tokio runtime
    pub fn new<P>(provider: P, config: &RealtimeConfig) -> RealtimeResult<Self>
    where
        P: ChangeFeedProvider + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| {
            RealtimeError::ConfigError("realtime registry requires a tokio runtime".into())
        })?;
        Ok(Self::with_handle(Arc::new(provider), config, runtime))
    }

    /// Create a registry spawning its tasks on `runtime`
    pub fn with_handle(
        provider: Arc<dyn ChangeFeedProvider>,
        config: &RealtimeConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                debounce_window: config.debounce_window(),
                schema: config.schema.clone(),
                user_column: config.user_column.clone(),
                runtime,
                registrations: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
                metrics: RealtimeMetrics::new(),
            }),
        }
    }

    /// Coalescing window
    pub fn debounce_window(&self) -> Duration {
        self.inner.debounce_window
    }

    /// Register `handler` for changes of `kinds` on `key`.
    ///
    /// Opens the key's provider channel on first use. The returned handle
    /// removes exactly this listener.
    pub fn subscribe<F>(&self, key: &SubscriptionKey, kinds: ChangeKinds, handler: F) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.add_listener(key, kinds, Arc::new(handler), None)
    }

    /// Same as [`subscribe`](Self::subscribe), also reporting channel and
    /// listener failures to `observer`
    pub fn subscribe_with_observer<F, O>(
        &self,
        key: &SubscriptionKey,
        kinds: ChangeKinds,
        handler: F,
        observer: O,
    ) -> Unsubscribe
    where
        F: Fn(&ChangeEvent) -> ListenerResult + Send + Sync + 'static,
        O: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.inner
            .add_listener(key, kinds, Arc::new(handler), Some(Arc::new(observer)))
    }

    /// Current channels and listeners
    pub fn stats(&self) -> RegistryStats {
        self.inner.stats()
    }

    /// Counters since construction
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Listeners registered for `key`
    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .registrations()
            .get(key)
            .map(|r| r.listeners.len())
            .unwrap_or(0)
    }

    /// Whether `key` has an open registration
    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.inner.registrations().contains_key(key)
    }

    /// Tear down every registration regardless of listeners. Idempotent.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

/// Removes one listener. Dropping it without calling
/// [`unsubscribe`](Self::unsubscribe) leaves the listener registered.
#[must_use = "dropping an Unsubscribe keeps the listener registered"]
#[derive(Debug)]
pub struct Unsubscribe {
    registry: Weak<RegistryInner>,
    key: SubscriptionKey,
    listener: ListenerId,
}

impl Unsubscribe {
    /// Remove the listener; tears the channel down if it was the last one
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove_listener(&self.key, self.listener);
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }
}

impl RegistryInner {
    /// Callbacks never run under this lock, so a poisoned map is still consistent
    fn registrations(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_listener(
        self: &Arc<Self>,
        key: &SubscriptionKey,
        kinds: ChangeKinds,
        handler: EventHandler,
        observer: Option<ErrorObserver>,
    ) -> Unsubscribe {
        let listener = Listener {
            id: ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed)),
            kinds,
            handler,
            observer,
        };
        let id = listener.id;
        let channel = key.channel_name();
        let key_str = key.to_string();

        let new_epoch = {
            let mut registrations = self.registrations();

            match registrations.get_mut(key) {
                Some(registration) => {
                    if !registration.kinds.covers(&kinds) {
                        let carried = registration.kinds.to_string();
                        let requested = kinds.to_string();
                        log_event(
                            Event::ListenerKindsNarrowed,
                            &[
                                ("carried", carried.as_str()),
                                ("channel", channel.as_str()),
                                ("requested", requested.as_str()),
                            ],
                        );
                    }
                    registration.listeners.push(listener);
                    None
                }
                None => {
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let mut registration = Registration {
                        epoch,
                        channel_name: channel.clone(),
                        kinds,
                        handle: None,
                        status: ChannelStatus::Joining,
                        listeners: Vec::new(),
                        coalescer: Coalescer::new(),
                        timer: None,
                        pump: None,
                    };
                    registration.listeners.push(listener);
                    registrations.insert(key.clone(), registration);
                    Some(epoch)
                }
            }
        };

        log_event(
            Event::ListenerAdded,
            &[("channel", channel.as_str()), ("key", key_str.as_str())],
        );

        if let Some(epoch) = new_epoch {
            self.open_channel(key, epoch, kinds);
        }

        Unsubscribe {
            registry: Arc::downgrade(self),
            key: key.clone(),
            listener: id,
        }
    }

    /// Open the provider channel for the registration `(key, epoch)`.
    ///
    /// The provider is called without the registry lock held. If the
    /// registration was torn down meanwhile, the new channel is closed
    /// again. A failed open leaves the registration in place with an
    /// errored status and no handle.
    fn open_channel(self: &Arc<Self>, key: &SubscriptionKey, epoch: u64, kinds: ChangeKinds) {
        let spec = ChannelSpec::for_key(key, &self.schema, &self.user_column, kinds);
        let (sink, receiver) = ChannelSink::channel();

        match self.provider.open(&spec, sink) {
            Ok(handle) => {
                self.metrics.increment_channels_opened();
                let kinds_str = kinds.to_string();
                log_event(
                    Event::ChannelOpen,
                    &[
                        ("channel", spec.name.as_str()),
                        ("filter", spec.filter.as_str()),
                        ("kinds", kinds_str.as_str()),
                    ],
                );

                let orphan = {
                    let mut registrations = self.registrations();
                    match registrations.get_mut(key).filter(|r| r.epoch == epoch) {
                        Some(registration) => {
                            registration.handle = Some(handle);
                            registration.pump = Some(self.spawn_pump(key.clone(), epoch, receiver));
                            None
                        }
                        None => Some(handle),
                    }
                };

                if let Some(handle) = orphan {
                    handle.close();
                    self.metrics.increment_channels_closed();
                    log_event(Event::ChannelClose, &[("channel", spec.name.as_str())]);
                }
            }
            Err(err) => {
                self.metrics.increment_channel_open_failures();
                let reason = err.to_string();
                log_event(
                    Event::ChannelOpenFailed,
                    &[("channel", spec.name.as_str()), ("reason", reason.as_str())],
                );
                let err = if err.is_channel_failure() {
                    err
                } else {
                    RealtimeError::ChannelOpenFailed {
                        channel: spec.name.clone(),
                        reason: reason.clone(),
                    }
                };

                let observers: Vec<ErrorObserver> = {
                    let mut registrations = self.registrations();
                    match registrations.get_mut(key).filter(|r| r.epoch == epoch) {
                        Some(registration) => {
                            registration.status = ChannelStatus::Errored(reason);
                            registration
                                .listeners
                                .iter()
                                .filter_map(|l| l.observer.clone())
                                .collect()
                        }
                        None => Vec::new(),
                    }
                };
                for observer in &observers {
                    notify(observer, &err);
                }
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        key: SubscriptionKey,
        epoch: u64,
        mut receiver: ChannelReceiver,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(message) = receiver.recv().await {
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                match message {
                    ChannelMessage::Event(event) => inner.on_event(&key, epoch, event),
                    ChannelMessage::Status(status) => inner.on_status(&key, epoch, status),
                }
            }
        })
    }

    fn on_event(self: &Arc<Self>, key: &SubscriptionKey, epoch: u64, event: ChangeEvent) {
        let mut registrations = self.registrations();
        let Some(registration) = registrations.get_mut(key).filter(|r| r.epoch == epoch) else {
            return;
        };

        self.metrics.increment_events_received();
        let kind = event.kind.to_string();
        log_event(
            Event::EventReceived,
            &[("channel", registration.channel_name.as_str()), ("kind", kind.as_str())],
        );

        if registration.coalescer.is_pending() {
            self.metrics.increment_events_coalesced();
            log_event(
                Event::EventCoalesced,
                &[("channel", registration.channel_name.as_str())],
            );
        }
        let generation = registration.coalescer.on_event(event);

        if let Some((_, previous)) = registration.timer.take() {
            previous.abort();
        }

        let deadline = Instant::now() + self.debounce_window;
        let registry = Arc::downgrade(self);
        let timer_key = key.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = registry.upgrade() {
                inner.on_timer(&timer_key, epoch, generation);
            }
        });
        registration.timer = Some((generation, timer));
    }

    fn on_timer(&self, key: &SubscriptionKey, epoch: u64, generation: u64) {
        let (pending, listeners, channel) = {
            let mut registrations = self.registrations();
            let Some(registration) = registrations.get_mut(key).filter(|r| r.epoch == epoch) else {
                return;
            };
            let Some(pending) = registration.coalescer.on_timer(generation) else {
                return;
            };
            if matches!(registration.timer, Some((current, _)) if current == generation) {
                registration.timer = None;
            }
            (
                pending,
                registration.listeners.clone(),
                registration.channel_name.clone(),
            )
        };

        self.deliver(key, epoch, &channel, &pending, &listeners);
    }

    /// Invoke listeners one after another, each with the newest pending
    /// event its kinds admit. A listener removed by an earlier callback in
    /// the same delivery is skipped.
    fn deliver(
        &self,
        key: &SubscriptionKey,
        epoch: u64,
        channel: &str,
        pending: &PendingEvents,
        listeners: &[Listener],
    ) {
        self.metrics.increment_deliveries();
        let mut invoked = 0u64;

        for listener in listeners {
            let Some(event) = pending.latest_for(listener.kinds) else {
                continue;
            };
            if !self.is_registered(key, epoch, listener.id) {
                continue;
            }

            invoked += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (listener.handler)(event)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_reason(payload.as_ref()),
            };

            self.metrics.increment_listener_failures();
            log_event(
                Event::ListenerFailed,
                &[("channel", channel), ("reason", reason.as_str())],
            );
            if let Some(observer) = &listener.observer {
                notify(
                    observer,
                    &RealtimeError::ListenerFailed {
                        channel: channel.to_string(),
                        reason,
                    },
                );
            }
        }

        self.metrics.add_listener_invocations(invoked);
        let invoked_str = invoked.to_string();
        let kinds_str = pending.len().to_string();
        log_event(
            Event::EventDelivered,
            &[
                ("channel", channel),
                ("kinds", kinds_str.as_str()),
                ("listeners", invoked_str.as_str()),
            ],
        );
    }

    fn is_registered(&self, key: &SubscriptionKey, epoch: u64, id: ListenerId) -> bool {
        self.registrations()
            .get(key)
            .filter(|r| r.epoch == epoch)
            .map(|r| r.listeners.iter().any(|l| l.id == id))
            .unwrap_or(false)
    }

    fn on_status(&self, key: &SubscriptionKey, epoch: u64, status: ChannelStatus) {
        let (channel, observers) = {
            let mut registrations = self.registrations();
            let Some(registration) = registrations.get_mut(key).filter(|r| r.epoch == epoch) else {
                return;
            };
            registration.status = status.clone();
            let observers: Vec<ErrorObserver> = if status.is_failure() {
                registration
                    .listeners
                    .iter()
                    .filter_map(|l| l.observer.clone())
                    .collect()
            } else {
                Vec::new()
            };
            (registration.channel_name.clone(), observers)
        };

        let status_str = status.to_string();
        let error = match &status {
            ChannelStatus::Errored(reason) => Some(RealtimeError::ChannelError {
                channel: channel.clone(),
                reason: reason.clone(),
            }),
            ChannelStatus::TimedOut => Some(RealtimeError::ChannelTimeout(channel.clone())),
            _ => None,
        };

        match error {
            Some(err) => {
                self.metrics.increment_channel_errors();
                log_event(
                    Event::ChannelError,
                    &[("channel", channel.as_str()), ("status", status_str.as_str())],
                );
                for observer in &observers {
                    notify(observer, &err);
                }
            }
            None => log_event(
                Event::ChannelStatus,
                &[("channel", channel.as_str()), ("status", status_str.as_str())],
            ),
        }
    }

    fn remove_listener(&self, key: &SubscriptionKey, id: ListenerId) {
        let channel = key.channel_name();
        let removed = {
            let mut registrations = self.registrations();
            let Some(registration) = registrations.get_mut(key) else {
                return;
            };
            let before = registration.listeners.len();
            registration.listeners.retain(|l| l.id != id);
            if registration.listeners.len() == before {
                return;
            }
            if registration.listeners.is_empty() {
                registrations.remove(key)
            } else {
                None
            }
        };

        log_event(Event::ListenerRemoved, &[("channel", channel.as_str())]);

        if let Some(registration) = removed {
            self.teardown(registration);
        }
    }

    /// Release everything a registration owns. Called without the lock held.
    fn teardown(&self, mut registration: Registration) {
        registration.coalescer.cancel();
        if let Some((_, timer)) = registration.timer.take() {
            timer.abort();
        }
        if let Some(pump) = registration.pump.take() {
            pump.abort();
        }
        if let Some(handle) = registration.handle.take() {
            handle.close();
            self.metrics.increment_channels_closed();
        }
        log_event(
            Event::ChannelClose,
            &[("channel", registration.channel_name.as_str())],
        );
    }

    fn cleanup(&self) {
        let drained: Vec<Registration> = {
            let mut registrations = self.registrations();
            registrations.drain().map(|(_, r)| r).collect()
        };

        let count = drained.len().to_string();
        for registration in drained {
            self.teardown(registration);
        }
        log_event(Event::RegistryCleanup, &[("channels", count.as_str())]);
    }

    fn stats(&self) -> RegistryStats {
        let registrations = self.registrations();

        let mut channels: Vec<ChannelStats> = registrations
            .iter()
            .map(|(key, r)| ChannelStats {
                name: r.channel_name.clone(),
                table: key.table().to_string(),
                user_id: key.user_id().to_string(),
                listener_count: r.listeners.len(),
                status: r.status.clone(),
                pending_delivery: r.coalescer.is_pending(),
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryStats {
            active_channel_count: channels.len(),
            total_listener_count: channels.iter().map(|c| c.listener_count).sum(),
            channels,
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let registrations = self
            .registrations
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, mut registration) in registrations.drain() {
            if let Some((_, timer)) = registration.timer.take() {
                timer.abort();
            }
            if let Some(pump) = registration.pump.take() {
                pump.abort();
            }
            if let Some(handle) = registration.handle.take() {
                handle.close();
            }
        }
    }
}

fn notify(observer: &ErrorObserver, err: &RealtimeError) {
    // Observer panics stay here
    let _ = panic::catch_unwind(AssertUnwindSafe(|| observer(err)));
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}
