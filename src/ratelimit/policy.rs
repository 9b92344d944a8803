//! Window policies: pure decision functions over counter records.
//!
//! Each policy takes the record currently stored for a key, the limit to
//! enforce and the current instant, and returns the verdict together with
//! the record to commit. Policies never touch shared state; the store is
//! responsible for making the read-evaluate-write sequence atomic.
//!
//! The fixed window is the default. It admits up to `2 * limit` events in a
//! short span straddling a reset. The sliding window counter and the token
//! bucket smooth that burst at the cost of a little more state.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::counter::{CounterRecord, CounterState, Limit};
use crate::error::TurnstileError;

/// Absorbs floating point rounding in refill and decay arithmetic.
const EPSILON: f64 = 1e-9;

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Admissions left before the budget is exhausted
    pub remaining: u64,
    /// The budget this verdict was computed against
    pub limit: u64,
    /// How long to wait before trying again; only set when denied
    pub retry_after: Option<Duration>,
    /// Time until the budget is fully restored
    pub reset_after: Duration,
}

impl Verdict {
    fn allow(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            retry_after: None,
            reset_after,
        }
    }

    fn deny(limit: u64, retry_after: Duration, reset_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            retry_after: Some(retry_after),
            reset_after,
        }
    }

    /// Retry hint rounded up to whole seconds, as used by `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter reset to zero at fixed boundaries
    #[default]
    FixedWindow,
    /// Weighted estimate over the current and previous window
    SlidingWindow,
    /// Continuously refilled permits, capacity `limit`
    TokenBucket,
}

impl Algorithm {
    /// Stable name used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }

    /// The record an absent key is equivalent to.
    pub fn fresh(&self, limit: &Limit, now: Instant) -> CounterRecord {
        match self {
            Algorithm::FixedWindow => CounterRecord {
                state: CounterState::FixedWindow {
                    count: 0,
                    reset_at: now + limit.window(),
                },
                expires_at: now + limit.window(),
            },
            Algorithm::SlidingWindow => CounterRecord {
                state: CounterState::SlidingWindow {
                    previous: 0,
                    current: 0,
                    window_start: now,
                },
                expires_at: now + limit.window() * 2,
            },
            Algorithm::TokenBucket => CounterRecord {
                state: CounterState::TokenBucket {
                    tokens: limit.limit() as f64,
                    last_refill: now,
                },
                expires_at: now + limit.window(),
            },
        }
    }

    /// Evaluate one admission against `record`.
    ///
    /// A stale record, or one written by a different algorithm, is treated
    /// as absent.
    pub fn apply(
        &self,
        record: &CounterRecord,
        limit: &Limit,
        now: Instant,
    ) -> (Verdict, CounterRecord) {
        let live = if record.is_stale(now) { None } else { Some(record) };

        match self {
            Algorithm::FixedWindow => fixed_window(live, limit, now),
            Algorithm::SlidingWindow => sliding_window(live, limit, now),
            Algorithm::TokenBucket => token_bucket(live, limit, now),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" | "fixed" => Ok(Algorithm::FixedWindow),
            "sliding_window" | "sliding" => Ok(Algorithm::SlidingWindow),
            "token_bucket" | "bucket" => Ok(Algorithm::TokenBucket),
            other => Err(TurnstileError::InvalidConfig(format!(
                "unknown algorithm '{}'",
                other
            ))),
        }
    }
}

fn fixed_window(
    record: Option<&CounterRecord>,
    limit: &Limit,
    now: Instant,
) -> (Verdict, CounterRecord) {
    let (count, reset_at) = match record.map(|r| &r.state) {
        Some(CounterState::FixedWindow { count, reset_at }) => (*count, *reset_at),
        _ => (0, now + limit.window()),
    };
    let until_reset = reset_at.saturating_duration_since(now);

    let (verdict, count) = if count < limit.limit() {
        let count = count + 1;
        (Verdict::allow(limit.limit(), limit.limit() - count, until_reset), count)
    } else {
        (Verdict::deny(limit.limit(), until_reset, until_reset), count)
    };

    let record = CounterRecord {
        state: CounterState::FixedWindow { count, reset_at },
        expires_at: reset_at,
    };
    (verdict, record)
}

fn sliding_window(
    record: Option<&CounterRecord>,
    limit: &Limit,
    now: Instant,
) -> (Verdict, CounterRecord) {
    let window = limit.window();
    let (mut previous, mut current, mut window_start) = match record.map(|r| &r.state) {
        Some(CounterState::SlidingWindow {
            previous,
            current,
            window_start,
        }) => (*previous, *current, *window_start),
        _ => (0, 0, now),
    };

    // A live record is less than two windows old, so at most one roll.
    if now.saturating_duration_since(window_start) >= window {
        previous = current;
        current = 0;
        window_start += window;
    }

    let window_secs = window.as_secs_f64();
    let elapsed = now.saturating_duration_since(window_start).as_secs_f64();
    let estimate = previous as f64 * (1.0 - elapsed / window_secs) + current as f64;
    let capacity = limit.limit() as f64;
    let window_end = window_start + window;
    let expires_at = window_start + window * 2;
    let until_reset = expires_at.saturating_duration_since(now);

    let verdict = if estimate + 1.0 <= capacity + EPSILON {
        current += 1;
        let remaining = (capacity - estimate - 1.0).max(0.0).floor() as u64;
        Verdict::allow(limit.limit(), remaining, until_reset)
    } else if limit.limit() == 0 {
        Verdict::deny(0, window_end.saturating_duration_since(now), until_reset)
    } else {
        let target = capacity - 1.0;
        let retry_after = if current as f64 > target {
            // This window alone is over budget: wait for it to become the
            // previous window and decay below the target.
            let decay = window_secs * (1.0 - target / current as f64);
            window_end.saturating_duration_since(now) + Duration::from_secs_f64(decay)
        } else {
            let needed = window_secs * (1.0 - (target - current as f64) / previous as f64);
            Duration::from_secs_f64((needed - elapsed).max(0.0))
        };
        Verdict::deny(limit.limit(), retry_after, until_reset)
    };

    let record = CounterRecord {
        state: CounterState::SlidingWindow {
            previous,
            current,
            window_start,
        },
        expires_at,
    };
    (verdict, record)
}

fn token_bucket(
    record: Option<&CounterRecord>,
    limit: &Limit,
    now: Instant,
) -> (Verdict, CounterRecord) {
    let window = limit.window();

    if limit.limit() == 0 {
        let record = CounterRecord {
            state: CounterState::TokenBucket {
                tokens: 0.0,
                last_refill: now,
            },
            expires_at: now + window,
        };
        return (Verdict::deny(0, window, window), record);
    }

    let capacity = limit.limit() as f64;
    let rate = capacity / window.as_secs_f64();
    let tokens = match record.map(|r| &r.state) {
        Some(CounterState::TokenBucket { tokens, last_refill }) => {
            let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
            (tokens + elapsed * rate).min(capacity)
        }
        _ => capacity,
    };

    let (verdict, tokens) = if tokens + EPSILON >= 1.0 {
        let tokens = (tokens - 1.0).max(0.0);
        let until_full = Duration::from_secs_f64((capacity - tokens) / rate);
        let remaining = (tokens + EPSILON).floor() as u64;
        (Verdict::allow(limit.limit(), remaining, until_full), tokens)
    } else {
        let retry_after = Duration::from_secs_f64((1.0 - tokens) / rate);
        let until_full = Duration::from_secs_f64((capacity - tokens) / rate);
        (Verdict::deny(limit.limit(), retry_after, until_full), tokens)
    };

    let record = CounterRecord {
        state: CounterState::TokenBucket {
            tokens,
            last_refill: now,
        },
        expires_at: now + verdict.reset_after,
    };
    (verdict, record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// Run `n` checks at `now`, threading the record through.
    fn run(
        algorithm: Algorithm,
        record: &mut CounterRecord,
        limit: &Limit,
        now: Instant,
        n: usize,
    ) -> Vec<Verdict> {
        (0..n)
            .map(|_| {
                let (verdict, next) = algorithm.apply(record, limit, now);
                *record = next;
                verdict
            })
            .collect()
    }

    #[test]
    fn test_fixed_window_counts_down() {
        let t0 = Instant::now();
        let limit = Limit::new(3, secs(60)).unwrap();
        let mut record = Algorithm::FixedWindow.fresh(&limit, t0);

        let verdicts = run(Algorithm::FixedWindow, &mut record, &limit, t0, 4);
        let remaining: Vec<u64> = verdicts.iter().map(|v| v.remaining).collect();

        assert!(verdicts[..3].iter().all(|v| v.allowed));
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert!(!verdicts[3].allowed);
        assert_eq!(verdicts[3].retry_after, Some(secs(60)));
    }

    #[test]
    fn test_fixed_window_resets_after_window() {
        let t0 = Instant::now();
        let limit = Limit::new(3, secs(60)).unwrap();
        let mut record = Algorithm::FixedWindow.fresh(&limit, t0);
        run(Algorithm::FixedWindow, &mut record, &limit, t0, 4);

        let (verdict, record) = Algorithm::FixedWindow.apply(&record, &limit, t0 + secs(61));
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
        assert_eq!(record.expires_at, t0 + secs(121));
    }

    #[test]
    fn test_fixed_window_boundary_burst() {
        // Up to 2 * limit admissions straddling a reset.
        let t0 = Instant::now();
        let limit = Limit::new(5, secs(10)).unwrap();
        let mut record = Algorithm::FixedWindow.fresh(&limit, t0);

        let before_reset = t0 + Duration::from_millis(9_900);
        let after_reset = t0 + Duration::from_millis(10_100);
        let before = run(Algorithm::FixedWindow, &mut record, &limit, before_reset, 5);
        let after = run(Algorithm::FixedWindow, &mut record, &limit, after_reset, 5);

        assert!(before.iter().chain(after.iter()).all(|v| v.allowed));
    }

    #[test]
    fn test_zero_limit_always_denies() {
        let t0 = Instant::now();
        let limit = Limit::new(0, secs(60)).unwrap();

        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let mut record = algorithm.fresh(&limit, t0);
            let verdicts = run(algorithm, &mut record, &limit, t0, 3);
            assert!(verdicts.iter().all(|v| !v.allowed), "{} admitted", algorithm);
            assert!(verdicts.iter().all(|v| v.remaining == 0));
            assert!(verdicts.iter().all(|v| v.retry_after.is_some()));
        }
    }

    #[test]
    fn test_token_bucket_starts_full_and_refills() {
        let t0 = Instant::now();
        // One token per second.
        let limit = Limit::new(2, secs(2)).unwrap();
        let mut record = Algorithm::TokenBucket.fresh(&limit, t0);

        let verdicts = run(Algorithm::TokenBucket, &mut record, &limit, t0, 3);
        assert!(verdicts[0].allowed);
        assert_eq!(verdicts[0].remaining, 1);
        assert!(verdicts[1].allowed);
        assert_eq!(verdicts[1].remaining, 0);
        assert!(!verdicts[2].allowed);
        assert_eq!(verdicts[2].retry_after, Some(secs(1)));

        let (verdict, _) = Algorithm::TokenBucket.apply(&record, &limit, t0 + secs(1));
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[test]
    fn test_token_bucket_partial_refill_retry_hint() {
        let t0 = Instant::now();
        let limit = Limit::new(2, secs(2)).unwrap();
        let mut record = Algorithm::TokenBucket.fresh(&limit, t0);
        run(Algorithm::TokenBucket, &mut record, &limit, t0, 2);

        let (verdict, _) =
            Algorithm::TokenBucket.apply(&record, &limit, t0 + Duration::from_millis(250));
        assert!(!verdict.allowed);
        let retry = verdict.retry_after.unwrap();
        assert!((retry.as_secs_f64() - 0.75).abs() < 1e-6);
        assert_eq!(verdict.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_token_bucket_smooths_boundary_burst() {
        let t0 = Instant::now();
        let limit = Limit::new(5, secs(10)).unwrap();
        let mut record = Algorithm::TokenBucket.fresh(&limit, t0);

        let first = run(Algorithm::TokenBucket, &mut record, &limit, t0, 5);
        let second = run(Algorithm::TokenBucket, &mut record, &limit, t0 + secs(2), 5);

        assert!(first.iter().all(|v| v.allowed));
        // 2s at 0.5 tokens/s refills exactly one token.
        assert_eq!(second.iter().filter(|v| v.allowed).count(), 1);
    }

    #[test]
    fn test_sliding_window_weights_previous_window() {
        let t0 = Instant::now();
        let limit = Limit::new(10, secs(10)).unwrap();
        let mut record = Algorithm::SlidingWindow.fresh(&limit, t0);

        let first = run(Algorithm::SlidingWindow, &mut record, &limit, t0, 10);
        assert!(first.iter().all(|v| v.allowed));

        // Halfway into the next window half of the previous ten still count.
        let second = run(Algorithm::SlidingWindow, &mut record, &limit, t0 + secs(15), 10);
        assert_eq!(second.iter().filter(|v| v.allowed).count(), 5);

        let denied = second.last().unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_sliding_window_retry_hint_is_sufficient() {
        let t0 = Instant::now();
        let limit = Limit::new(4, secs(8)).unwrap();
        let mut record = Algorithm::SlidingWindow.fresh(&limit, t0);
        run(Algorithm::SlidingWindow, &mut record, &limit, t0, 4);

        let (denied, next) = Algorithm::SlidingWindow.apply(&record, &limit, t0 + secs(1));
        assert!(!denied.allowed);
        record = next;

        let retry_at = t0 + secs(1) + denied.retry_after.unwrap() + Duration::from_millis(1);
        let (verdict, _) = Algorithm::SlidingWindow.apply(&record, &limit, retry_at);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_sliding_window_goes_stale_after_two_windows() {
        let t0 = Instant::now();
        let limit = Limit::new(3, secs(10)).unwrap();
        let mut record = Algorithm::SlidingWindow.fresh(&limit, t0);
        run(Algorithm::SlidingWindow, &mut record, &limit, t0, 3);

        assert!(!record.is_stale(t0 + secs(19)));
        assert!(record.is_stale(t0 + secs(20)));

        let (verdict, _) = Algorithm::SlidingWindow.apply(&record, &limit, t0 + secs(20));
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
    }

    #[test]
    fn test_foreign_record_treated_as_absent() {
        let t0 = Instant::now();
        let limit = Limit::new(2, secs(60)).unwrap();
        let mut record = Algorithm::FixedWindow.fresh(&limit, t0);
        run(Algorithm::FixedWindow, &mut record, &limit, t0, 2);

        let (verdict, next) = Algorithm::TokenBucket.apply(&record, &limit, t0);
        assert!(verdict.allowed);
        assert!(matches!(next.state, CounterState::TokenBucket { .. }));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("fixed_window".parse::<Algorithm>().unwrap(), Algorithm::FixedWindow);
        assert_eq!("token-bucket".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!("Sliding".parse::<Algorithm>().unwrap(), Algorithm::SlidingWindow);
        assert!("leaky".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::default(), Algorithm::FixedWindow);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let verdict = Verdict::deny(1, Duration::from_millis(1500), Duration::from_secs(2));
        assert_eq!(verdict.retry_after_secs(), Some(2));

        let verdict = Verdict::allow(1, 0, Duration::from_secs(2));
        assert_eq!(verdict.retry_after_secs(), None);
    }
}
