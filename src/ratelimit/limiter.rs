//! Core rate limiter implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{CounterRecord, Limit};
use super::key::AdmissionKey;
use super::policy::{Algorithm, Verdict};
use super::reaper::{Reaper, ReaperHandle};
use super::rules::PolicyTable;
use super::store::{KeyedCounterStore, RecordGuard};
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};

/// Retry hint handed out when a fault is resolved as a denial.
const FAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The admission-control facade.
///
/// Every check validates its inputs, locks the key's record, applies the
/// window policy and commits the result before returning. The limiter is
/// thread-safe and is meant to be shared behind an `Arc` by whatever serves
/// requests. Each instance owns its own counters.
pub struct RateLimiter {
    /// Counter records indexed by admission key
    store: Arc<KeyedCounterStore>,
    clock: Arc<dyn Clock>,
    /// Algorithm used when the caller or policy does not choose one
    algorithm: Algorithm,
    policies: RwLock<PolicyTable>,
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    clock: Option<Arc<dyn Clock>>,
    algorithm: Algorithm,
    shard_amount: Option<usize>,
    max_keys: Option<usize>,
    policies: PolicyTable,
}

impl RateLimiterBuilder {
    /// Use `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Default algorithm for checks.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Number of lock shards in the counter store.
    pub fn shard_amount(mut self, shard_amount: usize) -> Self {
        self.shard_amount = Some(shard_amount);
        self
    }

    /// Wake the reaper early once this many keys are held.
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    /// Per-action policies for [`RateLimiter::check_action`].
    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        let store = match self.shard_amount {
            Some(shards) => KeyedCounterStore::with_shard_amount(shards)?,
            None => KeyedCounterStore::new(),
        };
        let store = match self.max_keys {
            Some(max) => store.with_max_keys(max),
            None => store,
        };

        self.policies.validate()?;

        Ok(RateLimiter {
            store: Arc::new(store),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            algorithm: self.algorithm,
            policies: RwLock::new(self.policies),
        })
    }
}

impl RateLimiter {
    /// Create a fixed-window limiter on the system clock.
    pub fn new() -> Self {
        Self {
            store: Arc::new(KeyedCounterStore::new()),
            clock: Arc::new(SystemClock),
            algorithm: Algorithm::default(),
            policies: RwLock::new(PolicyTable::new()),
        }
    }

    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Create a limiter from configuration, loading the policy file if one
    /// is configured.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        let mut builder = Self::builder().algorithm(config.algorithm);

        if let Some(shards) = config.shard_amount {
            builder = builder.shard_amount(shards);
        }
        if let Some(max) = config.max_keys {
            builder = builder.max_keys(max);
        }
        if let Some(ref path) = config.policies_path {
            builder = builder.policies(PolicyTable::from_file(path)?);
        }

        builder.build()
    }

    /// Admit or deny one event for `key`: at most `limit` per `window`.
    ///
    /// A `limit` of zero denies every call. A zero `window` is rejected.
    pub fn check(&self, key: &str, limit: u64, window: Duration) -> Result<Verdict> {
        self.check_with(key, limit, window, self.algorithm)
    }

    /// Like [`check`](Self::check) with an explicit algorithm.
    pub fn check_with(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Verdict> {
        let key = AdmissionKey::new(key)?;
        let limit = Limit::new(limit, window)?;
        let now = self.clock.now();

        trace!(
            key = %key,
            limit = limit.limit(),
            window_ms = window.as_millis() as u64,
            "Checking admission"
        );

        let guard = self
            .store
            .get_or_init(&key, now, || algorithm.fresh(&limit, now));
        Ok(Self::decide(guard, &limit, algorithm, now))
    }

    /// Like [`check`](Self::check), but fails with
    /// [`TurnstileError::Contended`] instead of waiting when another caller
    /// holds the key's shard.
    ///
    /// Contention is a transient fault, not a denial.
    pub fn try_check(&self, key: &str, limit: u64, window: Duration) -> Result<Verdict> {
        let key = AdmissionKey::new(key)?;
        let limit = Limit::new(limit, window)?;
        let algorithm = self.algorithm;
        let now = self.clock.now();

        let guard = self
            .store
            .try_get_or_init(&key, now, || algorithm.fresh(&limit, now))
            .ok_or_else(|| TurnstileError::Contended(key.to_string()))?;
        Ok(Self::decide(guard, &limit, algorithm, now))
    }

    /// Check `"<subject>:<action>"` against the policy registered for
    /// `action`.
    pub fn check_action(&self, subject: &str, action: &str) -> Result<Verdict> {
        let key = AdmissionKey::scoped(subject, action)?;

        let (limit, algorithm) = {
            let policies = self.policies.read();
            let rule = policies
                .find(action)
                .ok_or_else(|| TurnstileError::UnknownAction(action.to_string()))?;
            (rule.limit()?, rule.algorithm.unwrap_or(self.algorithm))
        };

        self.check_with(key.as_str(), limit.limit(), limit.window(), algorithm)
    }

    fn decide(
        guard: RecordGuard<'_>,
        limit: &Limit,
        algorithm: Algorithm,
        now: Instant,
    ) -> Verdict {
        let (verdict, record) = algorithm.apply(&guard, limit, now);

        if !verdict.allowed {
            trace!(
                key = %guard.key(),
                limit = limit.limit(),
                algorithm = %algorithm,
                retry_after_ms = verdict.retry_after.map(|d| d.as_millis() as u64),
                "Admission denied"
            );
        }

        guard.commit(record);
        verdict
    }

    /// Replace the per-action policies.
    pub fn set_policies(&self, policies: PolicyTable) -> Result<()> {
        policies.validate()?;
        *self.policies.write() = policies;
        Ok(())
    }

    /// Current per-action policies.
    pub fn policies(&self) -> PolicyTable {
        self.policies.read().clone()
    }

    /// Default algorithm of this limiter.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Copy of the record held for `key`, if any.
    pub fn snapshot(&self, key: &str) -> Option<CounterRecord> {
        self.store.snapshot(key)
    }

    /// Number of records currently held.
    pub fn counter_count(&self) -> usize {
        self.store.len()
    }

    /// Drop every record, restoring all budgets.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// A reaper over this limiter's store and clock.
    pub fn reaper(&self, grace_period: Duration) -> Reaper {
        Reaper::new(Arc::clone(&self.store), Arc::clone(&self.clock), grace_period)
    }

    /// Start a background reaper. Must be called within a tokio runtime.
    pub fn spawn_reaper(&self, interval: Duration, grace_period: Duration) -> Result<ReaperHandle> {
        self.reaper(grace_period).spawn(interval)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// What a call site does when the limiter itself fails.
///
/// Security-sensitive call sites fail closed; cosmetic throttling may fail
/// open. The limiter never makes this choice on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat a fault as a denial
    #[default]
    Closed,
    /// Treat a fault as an admission, logging a warning
    Open,
}

impl FailurePolicy {
    /// Turn the outcome of a check into a verdict.
    pub fn resolve(&self, outcome: Result<Verdict>) -> Verdict {
        let error = match outcome {
            Ok(verdict) => return verdict,
            Err(e) => e,
        };

        match self {
            FailurePolicy::Closed => {
                debug!(error = %error, "Admission check failed, denying");
                Verdict {
                    allowed: false,
                    remaining: 0,
                    limit: 0,
                    retry_after: Some(FAULT_RETRY_AFTER),
                    reset_after: FAULT_RETRY_AFTER,
                }
            }
            FailurePolicy::Open => {
                warn!(error = %error, "Admission check failed, allowing");
                Verdict {
                    allowed: true,
                    remaining: 0,
                    limit: 0,
                    retry_after: None,
                    reset_after: Duration::ZERO,
                }
            }
        }
    }
}
