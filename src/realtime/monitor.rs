//! # Stats Monitor
//!
//! Polls [`RealtimeRegistry::stats`] on a fixed interval for the operator
//! view. Read-only: polling never changes registry state.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::observability::{log_event, Event};

use super::registry::{RealtimeRegistry, RegistryStats};

/// Background stats poller. Stops when dropped.
#[derive(Debug)]
pub struct StatsMonitor {
    task: JoinHandle<()>,
}

impl StatsMonitor {
    /// Poll `registry` every `interval`, logging each snapshot and handing
    /// it to `reporter`. The first snapshot is taken immediately.
    pub fn spawn<R>(registry: RealtimeRegistry, interval: Duration, reporter: R) -> Self
    where
        R: Fn(&RegistryStats) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let stats = registry.stats();

                let channels = stats.active_channel_count.to_string();
                let listeners = stats.total_listener_count.to_string();
                let names = stats.channel_names().join(",");
                log_event(
                    Event::RealtimeStats,
                    &[
                        ("channels", channels.as_str()),
                        ("listeners", listeners.as_str()),
                        ("names", names.as_str()),
                    ],
                );
                reporter(&stats);
            }
        });

        Self { task }
    }

    /// Stop polling
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::realtime::event::ChangeKinds;
    use crate::realtime::key::SubscriptionKey;
    use crate::realtime::memory::InMemoryFeed;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_reports_on_interval() {
        let registry = RealtimeRegistry::new(InMemoryFeed::new(), &RealtimeConfig::default()).unwrap();
        let key = SubscriptionKey::new("profiles", "u1").unwrap();
        let _sub = registry.subscribe(&key, ChangeKinds::all(), |_| Ok(()));

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let monitor = StatsMonitor::spawn(registry.clone(), Duration::from_secs(2), move |stats| {
            sink.lock().unwrap().push(stats.clone());
        });

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(monitor.is_running());
        monitor.stop();

        let reports = reports.lock().unwrap();
        // t = 0s, 2s, 4s
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].active_channel_count, 1);
        assert_eq!(reports[0].channel_names(), vec!["profiles:u1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_polling() {
        let registry = RealtimeRegistry::new(InMemoryFeed::new(), &RealtimeConfig::default()).unwrap();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);

        let monitor = StatsMonitor::spawn(registry, Duration::from_secs(1), move |_| {
            *sink.lock().unwrap() += 1;
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.stop();
        let seen = *count.lock().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*count.lock().unwrap(), seen);
    }
}
