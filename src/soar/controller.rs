//! Autonomous Response Controller - validated, deduplicated edge blocking
//!
//! # Per-IP state machine
//!
//! ```text
//!            validate
//!   Unknown ─────────┬──────────────► Rejected            (false, retryable)
//!                    │
//!                    ▼
//!                 Pending ──registry hit──► AlreadyBlocked (true)
//!                    │
//!                    ├──no credentials────► Simulated      (false, retryable)
//!                    │
//!                    ├──edge API 200──────► Blocked        (true, terminal)
//!                    │
//!                    └──error/non-200─────► EnforcementFailed (false, retryable)
//! ```
//!
//! Blocked is terminal for the lifetime of the controller: the edge API is
//! never called twice for the same IP. Concurrent first-time attempts for one
//! IP are serialized on a per-IP lock in the [`BlockedIpRegistry`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::edge::EdgeEnforcer;
use super::notify::Notifier;
use super::registry::BlockedIpRegistry;
use super::validate::{validate_block_target, IpRejection};
use crate::metrics::{BLOCKED_ATTACKS, BLOCK_DECISIONS};

/// How long the blocking entry point waits for its worker
const BLOCKING_WAIT: Duration = Duration::from_secs(10);

/// Prefix on every rule note written to the edge
const NOTES_PREFIX: &str = "AEGIS";

/// Final state of one block attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Edge API accepted the rule in this call
    Blocked,
    /// A previous call already enforced this IP
    AlreadyBlocked,
    /// Input refused before any side effect
    Rejected(IpRejection),
    /// No edge credentials configured; nothing was enforced
    Simulated,
    /// Edge API returned non-200 or was unreachable
    EnforcementFailed,
}

impl BlockOutcome {
    /// Whether the IP is blocked at the edge after this attempt
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockOutcome::Blocked | BlockOutcome::AlreadyBlocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockOutcome::Blocked => "blocked",
            BlockOutcome::AlreadyBlocked => "already_blocked",
            BlockOutcome::Rejected(_) => "rejected",
            BlockOutcome::Simulated => "simulated",
            BlockOutcome::EnforcementFailed => "enforcement_failed",
        }
    }
}

/// Record of one `decide()` call
#[derive(Debug, Clone)]
pub struct BlockDecision {
    /// Time-sortable id for log correlation
    pub id: Uuid,
    pub ip: String,
    pub reason: String,
    pub outcome: BlockOutcome,
}

/// Executes edge blocks on behalf of detectors.
///
/// Shared by every detector in the process (wrap in `Arc`). Without an
/// enforcer the controller runs in simulation mode; without a notifier it
/// skips operator alerts.
pub struct ResponseController {
    enforcer: Option<Arc<dyn EdgeEnforcer>>,
    notifier: Option<Arc<dyn Notifier>>,
    registry: BlockedIpRegistry,
    blocked_attacks: AtomicU64,
}

impl ResponseController {
    pub fn new(
        enforcer: Option<Arc<dyn EdgeEnforcer>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        if enforcer.is_none() {
            warn!("no edge API credentials configured, blocks will be simulated");
        }
        Self {
            enforcer,
            notifier,
            registry: BlockedIpRegistry::new(),
            blocked_attacks: AtomicU64::new(0),
        }
    }

    /// Controller with no enforcer and no notifier
    pub fn simulation() -> Self {
        Self::new(None, None)
    }

    /// Whether an edge enforcer is configured
    pub fn is_enforcing(&self) -> bool {
        self.enforcer.is_some()
    }

    /// Attacks blocked by this controller since it was created
    pub fn blocked_attacks(&self) -> u64 {
        self.blocked_attacks.load(Ordering::Relaxed)
    }

    /// Whether `ip` has been enforced by this controller
    pub fn is_blocked(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>()
            .map(|ip| self.registry.contains(&ip))
            .unwrap_or(false)
    }

    pub fn registry(&self) -> &BlockedIpRegistry {
        &self.registry
    }

    /// Block `ip` at the edge. Returns true iff the IP is now blocked.
    pub async fn block_ip(&self, ip: &str, reason: &str) -> bool {
        self.decide(ip, reason).await.outcome.is_blocked()
    }

    /// Block `ip` at the edge and return the full decision record.
    pub async fn decide(&self, ip: &str, reason: &str) -> BlockDecision {
        self.enforce(ip, reason).await.0
    }

    // ═══════════════════════════════════════════════════════════════════════
    // block_ip_blocking() - Entry point for synchronous callers
    // ═══════════════════════════════════════════════════════════════════════
    // Runs the async path on a dedicated worker thread with its own
    // current-thread runtime, so it is safe to call both from plain threads
    // and from inside a running tokio runtime. Waits at most BLOCKING_WAIT.
    // ═══════════════════════════════════════════════════════════════════════
    pub fn block_ip_blocking(self: &Arc<Self>, ip: &str, reason: &str) -> bool {
        let controller = Arc::clone(self);
        let ip = ip.to_string();
        let reason = reason.to_string();
        let (tx, rx) = std::sync::mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("aegis-block".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "failed to build runtime for blocking block_ip");
                        let _ = tx.send(false);
                        return;
                    }
                };

                runtime.block_on(async {
                    let (decision, notification) = controller.enforce(&ip, &reason).await;
                    let _ = tx.send(decision.outcome.is_blocked());
                    // Keep the runtime alive until the alert has been sent
                    if let Some(handle) = notification {
                        let _ = handle.await;
                    }
                });
            });

        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn block worker");
            return false;
        }

        match rx.recv_timeout(BLOCKING_WAIT) {
            Ok(blocked) => blocked,
            Err(_) => {
                warn!(wait = ?BLOCKING_WAIT, "blocking block_ip timed out");
                false
            }
        }
    }

    async fn enforce(&self, raw_ip: &str, reason: &str) -> (BlockDecision, Option<JoinHandle<()>>) {
        let id = Uuid::now_v7();
        let (outcome, notification) = self.run_state_machine(raw_ip, reason, id).await;
        BLOCK_DECISIONS.with_label_values(&[outcome.as_str()]).inc();

        let decision = BlockDecision {
            id,
            ip: raw_ip.to_string(),
            reason: reason.to_string(),
            outcome,
        };
        (decision, notification)
    }

    async fn run_state_machine(
        &self,
        raw_ip: &str,
        reason: &str,
        id: Uuid,
    ) -> (BlockOutcome, Option<JoinHandle<()>>) {
        let ip = match validate_block_target(raw_ip) {
            Ok(ip) => ip,
            Err(rejection) => {
                warn!(%id, ip = raw_ip, %rejection, "refusing to block address");
                return (BlockOutcome::Rejected(rejection), None);
            }
        };

        if self.registry.contains(&ip) {
            info!(%id, %ip, "IP already blocked");
            return (BlockOutcome::AlreadyBlocked, None);
        }

        let Some(enforcer) = &self.enforcer else {
            warn!(%id, %ip, reason, "[SIMULATION] edge block not enforced (no credentials)");
            return (BlockOutcome::Simulated, None);
        };

        let _guard = self.registry.lock(ip).await;

        // Another caller may have finished while we waited for the lock
        if self.registry.contains(&ip) {
            info!(%id, %ip, "IP blocked by concurrent request");
            return (BlockOutcome::AlreadyBlocked, None);
        }

        let notes = format!("{}: {}", NOTES_PREFIX, reason);
        match enforcer.block(&ip, &notes).await {
            Ok(()) => {
                self.registry.insert(ip);
                self.blocked_attacks.fetch_add(1, Ordering::Relaxed);
                BLOCKED_ATTACKS.inc();
                error!(%id, %ip, reason, backend = enforcer.name(), "IP blocked at the edge");

                let notification = self.spawn_notification(ip, reason);
                (BlockOutcome::Blocked, notification)
            }
            Err(e) => {
                error!(%id, %ip, error = %e, "edge enforcement failed");
                (BlockOutcome::EnforcementFailed, None)
            }
        }
    }

    /// Fire-and-continue operator alert; failures are logged and dropped.
    fn spawn_notification(&self, ip: IpAddr, reason: &str) -> Option<JoinHandle<()>> {
        let notifier = Arc::clone(self.notifier.as_ref()?);
        let text = format!("AEGIS SOAR: IP {} blocked\nReason: {}", ip, reason);

        Some(tokio::spawn(async move {
            if let Err(e) = notifier.notify(&text).await {
                warn!(%ip, error = %e, "operator notification failed");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soar::edge::EnforcementError;
    use crate::soar::notify::NotifyError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Enforcer that counts calls and answers with a fixed result
    struct CountingEnforcer {
        calls: AtomicUsize,
        succeed: bool,
        delay: Duration,
    }

    impl CountingEnforcer {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed: true,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EdgeEnforcer for CountingEnforcer {
        async fn block(&self, _ip: &IpAddr, _notes: &str) -> Result<(), EnforcementError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.succeed {
                Ok(())
            } else {
                Err(EnforcementError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct ChannelNotifier {
        tx: mpsc::UnboundedSender<String>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, text: &str) -> Result<(), NotifyError> {
            let _ = self.tx.send(text.to_string());
            if self.fail {
                Err(NotifyError::Rejected(502))
            } else {
                Ok(())
            }
        }
    }

    fn controller_with(enforcer: Arc<CountingEnforcer>) -> ResponseController {
        ResponseController::new(Some(enforcer as Arc<dyn EdgeEnforcer>), None)
    }

    #[tokio::test]
    async fn test_rejects_internal_addresses_without_calling_edge() {
        let enforcer = CountingEnforcer::new(true);
        let controller = controller_with(enforcer.clone());

        for ip in ["127.0.0.1", "10.1.2.3", "192.168.1.100", "::1", "garbage", ""] {
            let decision = controller.decide(ip, "test").await;
            assert!(matches!(decision.outcome, BlockOutcome::Rejected(_)), "{}", ip);
            assert!(!controller.block_ip(ip, "test").await);
        }
        assert_eq!(enforcer.calls(), 0);
        assert_eq!(controller.blocked_attacks(), 0);
    }

    #[tokio::test]
    async fn test_block_then_dedup() {
        let enforcer = CountingEnforcer::new(true);
        let controller = controller_with(enforcer.clone());

        assert!(controller.block_ip("203.0.113.1", "eBPF Violation: x").await);
        assert!(controller.is_blocked("203.0.113.1"));

        let second = controller.decide("203.0.113.1", "again").await;
        assert_eq!(second.outcome, BlockOutcome::AlreadyBlocked);
        assert!(second.outcome.is_blocked());

        assert_eq!(enforcer.calls(), 1);
        assert_eq!(controller.blocked_attacks(), 1);
    }

    #[tokio::test]
    async fn test_simulation_returns_false() {
        let controller = ResponseController::simulation();
        let decision = controller.decide("203.0.113.1", "test").await;

        assert_eq!(decision.outcome, BlockOutcome::Simulated);
        assert!(!decision.outcome.is_blocked());
        assert!(!controller.is_blocked("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_enforcement_failure_is_retryable() {
        let enforcer = CountingEnforcer::new(false);
        let controller = controller_with(enforcer.clone());

        assert!(!controller.block_ip("198.51.100.4", "x").await);
        assert!(!controller.block_ip("198.51.100.4", "x").await);

        // No internal retry, but a new call does try again
        assert_eq!(enforcer.calls(), 2);
        assert!(!controller.is_blocked("198.51.100.4"));
        assert_eq!(controller.registry().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_blocks_call_edge_once() {
        let enforcer = CountingEnforcer::slow(Duration::from_millis(50));
        let controller = Arc::new(controller_with(enforcer.clone()));

        let a = {
            let c = Arc::clone(&controller);
            tokio::spawn(async move { c.block_ip("203.0.113.1", "a").await })
        };
        let b = {
            let c = Arc::clone(&controller);
            tokio::spawn(async move { c.block_ip("203.0.113.1", "b").await })
        };

        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert_eq!(enforcer.calls(), 1);
        assert!(controller.is_blocked("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_change_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(ChannelNotifier { tx, fail: true });
        let controller = ResponseController::new(
            Some(CountingEnforcer::new(true) as Arc<dyn EdgeEnforcer>),
            Some(notifier as Arc<dyn Notifier>),
        );

        assert!(controller.block_ip("203.0.113.50", "eBPF Violation: p").await);

        let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("203.0.113.50"));
        assert!(text.contains("eBPF Violation: p"));
    }

    #[test]
    fn test_blocking_entry_point_outside_runtime() {
        let enforcer = CountingEnforcer::new(true);
        let controller = Arc::new(controller_with(enforcer.clone()));

        assert!(controller.block_ip_blocking("203.0.113.77", "sync"));
        assert!(!controller.block_ip_blocking("127.0.0.1", "sync"));
        assert_eq!(enforcer.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_entry_point_inside_runtime() {
        let enforcer = CountingEnforcer::new(true);
        let controller = Arc::new(controller_with(enforcer.clone()));

        let c = Arc::clone(&controller);
        let blocked = tokio::task::spawn_blocking(move || c.block_ip_blocking("203.0.113.78", "sync"))
            .await
            .unwrap();
        assert!(blocked);

        // Called directly on a runtime worker thread as well
        assert!(controller.block_ip_blocking("203.0.113.78", "sync again"));
        assert_eq!(enforcer.calls(), 1);
    }
}
