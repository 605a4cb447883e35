//! Admission Rate Limiting for inbound entry points
//!
//! # Why Rate Limiting?
//!
//! Every entry point that accepts untrusted input (logins, uploads, webhooks)
//! can be flooded. The limiter caps how many requests a single identity may
//! make per bucket in a fixed time window.
//!
//! # Algorithm: Fixed Window
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  FIXED WINDOW COUNTER                                             │
//! │                                                                   │
//! │  window_start = floor(now / W) * W                                │
//! │  key          = "rl:{bucket}:{window_start}:{identity}"           │
//! │                                                                   │
//! │   T            T+W           T+2W                                 │
//! │   ├─────────────┼─────────────┼──────►  time                      │
//! │   │ ● ● ● ● ●   │ ● ●         │                                   │
//! │   │ count = 5   │ count = 2   │  ← one counter per window         │
//! │                                                                   │
//! │  allowed = count <= limit                                         │
//! │  A request at exactly T+W starts a fresh counter.                 │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backends
//!
//! 1. **Store** (preferred): atomic increment in a shared [`CounterStore`],
//!    expiry set to `W + 5` seconds on the first hit to absorb clock drift.
//! 2. **Memory** (fallback): used when no store is configured or the store
//!    errors. Entries are `(count, expires_at)`; expired entries restart at
//!    zero, and the map is purged of expired entries every 100 calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use super::store::CounterStore;
use crate::metrics::RATE_LIMIT_CHECKS;

/// Extra TTL on store keys beyond the window length (clock drift guard)
const STORE_EXPIRY_GRACE_SECS: u64 = 5;

/// Memory fallback is purged of expired entries once per this many calls
const PURGE_EVERY: u64 = 100;

/// Rate limit state reported alongside every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Maximum requests per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Requests left in the current window (never negative)
    pub remaining: u64,
    /// Seconds until the current window closes (never negative)
    pub reset_in: u64,
}

impl RateLimitInfo {
    /// `X-RateLimit-*` response headers for HTTP entry points.
    pub fn http_headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_in.to_string()),
        ]
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Counter state after this request
    pub info: RateLimitInfo,
}

/// One in-memory window counter
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u64,
    expires_at: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// RateLimiter (Fixed Window)
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   A shared admission limiter. One instance per application context; every
//   entry point calls check() with its own bucket name.
//
// HOW TO USE:
//   let limiter = RateLimiter::in_memory();
//   let decision = limiter.check("login", remote_ip, 10, 60).await;
//   if !decision.allowed {
//       // reject with 429 + decision.info.http_headers()
//   }
// ═══════════════════════════════════════════════════════════════════════════

pub struct RateLimiter {
    /// Preferred backend; None means memory only
    store: Option<Arc<dyn CounterStore>>,

    /// Fallback counters keyed like the store keys
    memory: Mutex<HashMap<String, WindowEntry>>,

    /// Calls since the last purge of `memory`
    calls_since_purge: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter that prefers `store` and falls back to memory.
    pub fn new(store: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            store,
            memory: Mutex::new(HashMap::new()),
            calls_since_purge: AtomicU64::new(0),
        }
    }

    /// Create a limiter that only uses the in-process map.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Whether a shared store is configured
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Number of live entries in the memory fallback (for monitoring)
    pub fn memory_entries(&self) -> usize {
        self.lock_memory().len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // check() - Count one request against (bucket, identity)
    // ═══════════════════════════════════════════════════════════════════════
    // RETURNS:
    //   allowed = true  → count (including this request) <= limit
    //   allowed = false → over the limit for this window
    // ═══════════════════════════════════════════════════════════════════════
    pub async fn check(
        &self,
        bucket: &str,
        identity: &str,
        limit: u64,
        window_seconds: u64,
    ) -> RateLimitDecision {
        self.check_at(bucket, identity, limit, window_seconds, unix_now())
            .await
    }

    /// Same as [`check`](Self::check) with an explicit clock reading (unix seconds).
    pub async fn check_at(
        &self,
        bucket: &str,
        identity: &str,
        limit: u64,
        window_seconds: u64,
        now: u64,
    ) -> RateLimitDecision {
        let window_seconds = window_seconds.max(1);
        let window_start = (now / window_seconds) * window_seconds;
        let key = format!("rl:{}:{}:{}", bucket, window_start, identity);
        let reset_in = (window_start + window_seconds).saturating_sub(now);

        if let Some(store) = &self.store {
            match store
                .incr_with_expiry(&key, window_seconds + STORE_EXPIRY_GRACE_SECS)
                .await
            {
                Ok(count) => {
                    return self.decide(bucket, "store", count, limit, window_seconds, reset_in);
                }
                Err(e) => {
                    warn!(
                        backend = store.name(),
                        error = %e,
                        "rate limit store unavailable, using memory fallback"
                    );
                }
            }
        }

        let count = self.incr_memory(&key, window_seconds, now);
        self.decide(bucket, "memory", count, limit, window_seconds, reset_in)
    }

    fn decide(
        &self,
        bucket: &str,
        backend: &str,
        count: u64,
        limit: u64,
        window_seconds: u64,
        reset_in: u64,
    ) -> RateLimitDecision {
        let allowed = count <= limit;
        RATE_LIMIT_CHECKS
            .with_label_values(&[bucket, if allowed { "true" } else { "false" }, backend])
            .inc();

        if !allowed {
            debug!(bucket, backend, count, limit, "rate limited");
        }

        RateLimitDecision {
            allowed,
            info: RateLimitInfo {
                limit,
                window_seconds,
                remaining: limit.saturating_sub(count),
                reset_in,
            },
        }
    }

    fn incr_memory(&self, key: &str, window_seconds: u64, now: u64) -> u64 {
        let mut memory = self.lock_memory();
        self.maybe_purge(&mut memory, now);

        let entry = memory.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            expires_at: now + window_seconds,
        });
        if entry.expires_at <= now {
            *entry = WindowEntry {
                count: 0,
                expires_at: now + window_seconds,
            };
        }
        entry.count += 1;
        entry.count
    }

    /// Amortized cleanup: drop expired entries once every PURGE_EVERY calls.
    fn maybe_purge(&self, memory: &mut HashMap<String, WindowEntry>, now: u64) {
        let calls = self.calls_since_purge.fetch_add(1, Ordering::Relaxed) + 1;
        if calls < PURGE_EVERY {
            return;
        }
        self.calls_since_purge.store(0, Ordering::Relaxed);

        let before = memory.len();
        memory.retain(|_, entry| entry.expires_at > now);
        let purged = before - memory.len();
        if purged > 0 {
            debug!(purged, "purged expired rate limit entries");
        }
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, HashMap<String, WindowEntry>> {
        // A poisoned map only holds counters; keep serving from it.
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
