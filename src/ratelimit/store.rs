//! Keyed counter storage.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::counter::CounterRecord;
use super::key::AdmissionKey;
use crate::error::{Result, TurnstileError};

/// Owns every counter record, one per admission key.
///
/// The map is split into lock-protected shards. [`get_or_init`] holds the
/// key's shard lock until the returned guard is committed or dropped, so all
/// reads and writes of one key are serialized while keys living on other
/// shards proceed in parallel. Eviction goes through the same shard locks.
///
/// A caller holding a [`RecordGuard`] must not call back into the store
/// before releasing it.
///
/// [`get_or_init`]: KeyedCounterStore::get_or_init
pub struct KeyedCounterStore {
    records: DashMap<AdmissionKey, CounterRecord>,
    /// Approximate record count, resynced on every sweep
    approx_len: AtomicUsize,
    /// Soft bound on distinct keys before the reaper is woken early
    max_keys: Option<usize>,
    /// Set once the bound is crossed, cleared when back under it
    over_bound: AtomicBool,
    pressure: Notify,
}

/// Exclusive access to one key's record.
pub struct RecordGuard<'a> {
    entry: RefMut<'a, AdmissionKey, CounterRecord>,
    store: &'a KeyedCounterStore,
    created: bool,
}

impl KeyedCounterStore {
    /// Create a store with dashmap's default shard count.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            approx_len: AtomicUsize::new(0),
            max_keys: None,
            over_bound: AtomicBool::new(false),
            pressure: Notify::new(),
        }
    }

    /// Create a store with an explicit shard count.
    ///
    /// The count must be a power of two greater than one.
    pub fn with_shard_amount(shard_amount: usize) -> Result<Self> {
        if shard_amount < 2 || !shard_amount.is_power_of_two() {
            return Err(TurnstileError::InvalidConfig(format!(
                "shard amount must be a power of two greater than one, got {}",
                shard_amount
            )));
        }

        Ok(Self {
            records: DashMap::with_shard_amount(shard_amount),
            approx_len: AtomicUsize::new(0),
            max_keys: None,
            over_bound: AtomicBool::new(false),
            pressure: Notify::new(),
        })
    }

    /// Signal memory pressure once more than `max_keys` records are held.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    /// Lock the record for `key`, inserting `init()` if it is absent or stale.
    pub fn get_or_init<F>(
        &self,
        key: &AdmissionKey,
        now: Instant,
        init: F,
    ) -> RecordGuard<'_>
    where
        F: FnOnce() -> CounterRecord,
    {
        self.settle(self.records.entry(key.clone()), now, init)
    }

    /// Like [`get_or_init`](Self::get_or_init), but returns `None` instead of
    /// waiting when the key's shard is locked.
    pub fn try_get_or_init<F>(
        &self,
        key: &AdmissionKey,
        now: Instant,
        init: F,
    ) -> Option<RecordGuard<'_>>
    where
        F: FnOnce() -> CounterRecord,
    {
        self.records
            .try_entry(key.clone())
            .map(|entry| self.settle(entry, now, init))
    }

    fn settle<'a, F>(
        &'a self,
        entry: Entry<'a, AdmissionKey, CounterRecord>,
        now: Instant,
        init: F,
    ) -> RecordGuard<'a>
    where
        F: FnOnce() -> CounterRecord,
    {
        match entry {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_stale(now) {
                    trace!(key = %occupied.key(), "Replacing stale counter record");
                    occupied.insert(init());
                }
                RecordGuard {
                    entry: occupied.into_ref(),
                    store: self,
                    created: false,
                }
            }
            Entry::Vacant(vacant) => {
                trace!(key = %vacant.key(), "Creating counter record");
                self.approx_len.fetch_add(1, Ordering::Relaxed);
                RecordGuard {
                    entry: vacant.insert(init()),
                    store: self,
                    created: true,
                }
            }
        }
    }

    /// Remove the record for `key`. Returns whether one was present.
    pub fn evict(&self, key: &str) -> bool {
        if self.records.remove(key).is_none() {
            return false;
        }

        let _ = self
            .approx_len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        self.rearm_pressure();
        true
    }

    /// Remove every record that has been stale for at least `grace`.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, now: Instant, grace: Duration) -> usize {
        let mut evicted = 0;
        self.records.retain(|_, record| {
            let idle = record.is_idle(now, grace);
            if idle {
                evicted += 1;
            }
            !idle
        });

        let remaining = self.records.len();
        self.approx_len.store(remaining, Ordering::Relaxed);
        self.rearm_pressure();

        if evicted > 0 {
            debug!(evicted = evicted, remaining = remaining, "Swept idle counter records");
        }
        evicted
    }

    /// Copy of the record for `key`, if any.
    pub fn snapshot(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Number of records held, live or stale.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
        self.approx_len.store(0, Ordering::Relaxed);
        self.over_bound.store(false, Ordering::Relaxed);
    }

    /// Notified once when a new key pushes the store past its key bound.
    /// The signal re-arms after a sweep or eviction brings it back under.
    pub fn pressure(&self) -> &Notify {
        &self.pressure
    }

    /// Wake the reaper if this insert crossed the key bound.
    fn signal_pressure(&self) {
        let Some(max) = self.max_keys else {
            return;
        };

        let len = self.approx_len.load(Ordering::Relaxed);
        if len > max && !self.over_bound.swap(true, Ordering::AcqRel) {
            debug!(len = len, max_keys = max, "Counter store over key bound, waking reaper");
            self.pressure.notify_one();
        }
    }

    fn rearm_pressure(&self) {
        if let Some(max) = self.max_keys {
            if self.approx_len.load(Ordering::Relaxed) <= max {
                self.over_bound.store(false, Ordering::Release);
            }
        }
    }
}

impl Default for KeyedCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyedCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCounterStore")
            .field("len", &self.records.len())
            .field("max_keys", &self.max_keys)
            .field("over_bound", &self.over_bound.load(Ordering::Relaxed))
            .finish()
    }
}

impl<'a> RecordGuard<'a> {
    /// The key this guard locks.
    pub fn key(&self) -> &AdmissionKey {
        self.entry.key()
    }

    /// Store `record` for the key and release the lock.
    pub fn commit(self, record: CounterRecord) {
        let RecordGuard {
            mut entry,
            store,
            created,
        } = self;

        *entry = record;
        drop(entry);

        if created {
            store.signal_pressure();
        }
    }
}

impl Deref for RecordGuard<'_> {
    type Target = CounterRecord;

    fn deref(&self) -> &Self::Target {
        self.entry.value()
    }
}
