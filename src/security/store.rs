//! Shared counter store for the admission rate limiter
//!
//! The preferred rate-limit path keeps its counters in an external key-value
//! store so every entry point in the process (and, if the store is shared, every
//! replica) sees the same window. The store only needs one primitive:
//!
//! ```text
//! incr_with_expiry(key, ttl)
//!     value = INCR key
//!     if value == 1: EXPIRE key ttl      ← first hit of a window sets its TTL
//!     return value
//! ```
//!
//! Both steps run inside a single Lua script on the Redis side, so the increment
//! and the expiry are atomic per key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Atomic INCR + first-hit EXPIRE, evaluated server-side.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// Error type for counter store operations
#[derive(Debug)]
pub enum StoreError {
    /// Could not connect to the store
    Connection(String),
    /// A command against the store failed
    Command(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection(msg) => write!(f, "Store connection error: {}", msg),
            StoreError::Command(msg) => write!(f, "Store command error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// A keyed counter store with atomic increment-with-expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the new value.
    ///
    /// When the returned value is 1 the key is given a TTL of `ttl_secs`.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError>;

    /// Short backend name used in logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// Redis-backed counter store
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Connect to the store at `url` and verify it answers PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "failed to create Redis client for rate limiting");
            StoreError::Connection(e.to_string())
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "failed to create Redis connection manager");
            StoreError::Connection(e.to_string())
        })?;

        let mut conn = connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        debug!("connected to Redis for rate limiting");

        Ok(Self {
            connection,
            script: redis::Script::new(INCR_WITH_EXPIRY_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = self
            .script
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        u64::try_from(value)
            .map_err(|_| StoreError::Command(format!("negative counter value {}", value)))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
