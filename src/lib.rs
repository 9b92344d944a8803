//! Turnstile - In-Process Admission Control
//!
//! This crate decides whether an action may proceed right now. Route
//! handlers, server actions and background jobs call
//! [`RateLimiter::check`](ratelimit::RateLimiter::check) with a key such as
//! `"<subject>:<action>"` and honor the returned verdict. All state is
//! process-local: a restart restores every budget.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TurnstileError};
pub use ratelimit::{Algorithm, RateLimiter, Verdict};
