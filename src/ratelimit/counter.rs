//! Counter records and the limits they are evaluated against.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{Result, TurnstileError};

/// Coarse time window used by policy files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// Longest window accepted. Policies add up to two windows to the current
/// instant, which must stay representable.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// A validated budget: at most `limit` admissions per `window`.
///
/// A `limit` of zero is a valid, fully closed budget that denies every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    limit: u64,
    window: Duration,
}

impl Limit {
    /// Create a limit, rejecting an empty window or one longer than
    /// [`MAX_WINDOW`].
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(TurnstileError::InvalidConfig(
                "window must be greater than zero".to_string(),
            ));
        }

        if window > MAX_WINDOW {
            return Err(TurnstileError::InvalidConfig(format!(
                "window of {}s exceeds the maximum of {}s",
                window.as_secs(),
                MAX_WINDOW.as_secs()
            )));
        }

        Ok(Self { limit, window })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Algorithm-specific counter state.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterState {
    /// Events admitted in the window ending at `reset_at`.
    FixedWindow { count: u64, reset_at: Instant },
    /// Events in the current and the immediately preceding window.
    SlidingWindow {
        previous: u64,
        current: u64,
        window_start: Instant,
    },
    /// Fractional permits left as of `last_refill`.
    TokenBucket { tokens: f64, last_refill: Instant },
}

/// The per-key record held by the counter store.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterRecord {
    /// Algorithm state
    pub state: CounterState,
    /// Instant from which this record is equivalent to an absent one
    pub expires_at: Instant,
}

impl CounterRecord {
    /// Whether the record has expired and must be treated as absent.
    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Whether the record has been stale for at least `grace`. A grace too
    /// large to represent never elapses.
    pub fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.expires_at
            .checked_add(grace)
            .is_some_and(|idle_at| now >= idle_at)
    }

    /// Number of events counted in the current window, or permits consumed
    /// from a token bucket, rounded down.
    pub fn used(&self, limit: u64) -> u64 {
        match self.state {
            CounterState::FixedWindow { count, .. } => count,
            CounterState::SlidingWindow { current, .. } => current,
            CounterState::TokenBucket { tokens, .. } => {
                limit.saturating_sub(tokens.floor() as u64)
            }
        }
    }
}
