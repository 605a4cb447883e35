//! Admission control shared by every inbound entry point
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Entry point (login, upload, webhook)                           │
//! │         │                                                       │
//! │         ▼                                                       │
//! │  RateLimiter::check(bucket, identity, limit, window)            │
//! │         │                                                       │
//! │         ├──► CounterStore (Redis INCR + EXPIRE, atomic)         │
//! │         │         │                                             │
//! │         │         └─error─┐                                     │
//! │         │                 ▼                                     │
//! │         └──────────► in-process map (count, expires_at)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A missing or failing store never fails a check; the limiter degrades to
//! per-process counting.

pub mod rate_limit;
pub mod store;

pub use rate_limit::{RateLimitDecision, RateLimitInfo, RateLimiter};
pub use store::{CounterStore, RedisCounterStore, StoreError};
