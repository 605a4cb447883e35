//! Registry of IPs already enforced at the edge
//!
//! Two pieces of state, both scoped to one controller instance:
//!
//! ```text
//! blocked    HashSet<IpAddr>                   ← terminal: never re-submitted
//! in_flight  HashMap<IpAddr, Arc<Mutex<()>>>   ← one lock per IP being enforced
//! ```
//!
//! Callers take the per-IP lock before talking to the edge API and re-check
//! `blocked` once they hold it, so two concurrent first-time attempts for the
//! same IP produce exactly one external call. Different IPs never contend.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-lifetime set of enforced IPs plus per-IP enforcement locks
#[derive(Default)]
pub struct BlockedIpRegistry {
    blocked: RwLock<HashSet<IpAddr>>,
    in_flight: Mutex<HashMap<IpAddr, Arc<AsyncMutex<()>>>>,
}

impl BlockedIpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ip` has already been enforced
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(ip)
    }

    /// Record `ip` as enforced. Returns false if it was already present.
    pub fn insert(&self, ip: IpAddr) -> bool {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ip)
    }

    pub fn len(&self) -> usize {
        self.blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every enforced IP
    pub fn snapshot(&self) -> Vec<IpAddr> {
        self.blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Wait for exclusive enforcement rights on `ip`.
    pub async fn lock(&self, ip: IpAddr) -> EnforcementGuard<'_> {
        let lock = {
            let mut in_flight = self.lock_in_flight();
            Arc::clone(in_flight.entry(ip).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;

        EnforcementGuard {
            registry: self,
            ip,
            lock,
            guard: Some(guard),
        }
    }

    /// Number of IPs with a live enforcement lock (for tests and monitoring)
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, Arc<AsyncMutex<()>>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held while one caller enforces one IP. Dropping it releases the lock and
/// removes the map entry when nobody else is waiting on it.
pub struct EnforcementGuard<'a> {
    registry: &'a BlockedIpRegistry,
    ip: IpAddr,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EnforcementGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut in_flight = self.registry.lock_in_flight();
        // One reference in the map, one here: no waiters left.
        if Arc::strong_count(&self.lock) == 2 {
            in_flight.remove(&self.ip);
        }
    }
}
