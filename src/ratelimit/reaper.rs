//! Background eviction of idle counter records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::store::KeyedCounterStore;
use crate::error::{Result, TurnstileError};

/// Evicts records that have been stale for longer than a grace period.
///
/// Eviction takes the same shard locks as admission checks, so a record is
/// never removed while a check on its key is in flight.
#[derive(Debug, Clone)]
pub struct Reaper {
    store: Arc<KeyedCounterStore>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

/// Handle to a running reaper task.
///
/// Dropping the handle also stops the task at its next wake-up.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Create a reaper over `store`.
    pub fn new(
        store: Arc<KeyedCounterStore>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            grace_period,
        }
    }

    /// Run one sweep now. Returns the number of records evicted.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now(), self.grace_period)
    }

    /// Sweep every `interval`, and whenever the store reports key pressure.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self, interval: Duration) -> Result<ReaperHandle> {
        if interval.is_zero() {
            return Err(TurnstileError::InvalidConfig(
                "reaper interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = interval.as_millis() as u64,
            grace_period_ms = self.grace_period.as_millis() as u64,
            "Starting counter reaper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.store.pressure().notified() => {
                        debug!("Reaper woken by key pressure");
                    }
                    _ = shutdown_rx.changed() => break,
                }

                self.sweep();
            }

            info!("Counter reaper stopped");
        });

        Ok(ReaperHandle { shutdown, task })
    }
}

impl ReaperHandle {
    /// Stop the reaper and wait for its task to finish.
    pub async fn shutdown(self) {
        // Err means the task already exited.
        let _ = self.shutdown.send(true);

        if let Err(e) = self.task.await {
            warn!(error = %e, "Counter reaper task failed");
        }
    }

    /// Whether the reaper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::counter::{CounterRecord, CounterState};
    use crate::ratelimit::key::AdmissionKey;
    use std::time::Instant;

    fn insert(store: &KeyedCounterStore, key: &str, expires_at: Instant) {
        let record = CounterRecord {
            state: CounterState::FixedWindow {
                count: 1,
                reset_at: expires_at,
            },
            expires_at,
        };
        let key = AdmissionKey::new(key).unwrap();
        let init = record.clone();
        store.get_or_init(&key, expires_at - Duration::from_secs(1), move || init).commit(record);
    }

    #[test]
    fn test_sweep_respects_grace_period() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(KeyedCounterStore::new());
        let t0 = clock.now();

        insert(&store, "a", t0 + Duration::from_secs(10));
        insert(&store, "b", t0 + Duration::from_secs(100));

        let reaper = Reaper::new(store.clone(), clock.clone(), Duration::from_secs(30));

        clock.advance(Duration::from_secs(39));
        assert_eq!(reaper.sweep(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(reaper.sweep(), 1);
        assert!(store.snapshot("a").is_none());
        assert!(store.snapshot("b").is_some());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(KeyedCounterStore::new());
        let reaper = Reaper::new(store, clock, Duration::ZERO);

        assert!(matches!(
            reaper.spawn(Duration::ZERO),
            Err(TurnstileError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_spawned_reaper_sweeps_periodically() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(KeyedCounterStore::new());
        let t0 = clock.now();

        insert(&store, "a", t0 + Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));

        let handle = Reaper::new(store.clone(), clock.clone(), Duration::ZERO)
            .spawn(Duration::from_millis(10))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawned_reaper_wakes_on_pressure() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(KeyedCounterStore::new().with_max_keys(1));
        let t0 = clock.now();

        let handle = Reaper::new(store.clone(), clock.clone(), Duration::ZERO)
            .spawn(Duration::from_secs(3600))
            .unwrap();

        insert(&store, "a", t0 + Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));
        // Pushes the store past its bound and wakes the reaper.
        insert(&store, "b", clock.now() + Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.snapshot("a").is_none());
        assert!(store.snapshot("b").is_some());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_reaper() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(KeyedCounterStore::new());

        let handle = Reaper::new(store, clock, Duration::ZERO)
            .spawn(Duration::from_millis(10))
            .unwrap();
        let ReaperHandle { shutdown, task } = handle;
        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
