//! Admission control: keyed counters, window policies and eviction.

mod clock;
mod counter;
mod key;
mod limiter;
mod policy;
mod reaper;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterRecord, CounterState, Limit, TimeWindow, MAX_WINDOW};
pub use key::{AdmissionKey, MAX_KEY_LEN};
pub use limiter::{FailurePolicy, RateLimiter, RateLimiterBuilder};
pub use policy::{Algorithm, Verdict};
pub use reaper::{Reaper, ReaperHandle};
pub use rules::{ActionRule, PolicyTable};
pub use store::{KeyedCounterStore, RecordGuard};
