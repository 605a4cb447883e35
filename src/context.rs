//! Explicit wiring of the defense engines
//!
//! The daemon (and tests) build one [`DefenseContext`] and pass its parts
//! where they are needed. There are no process-wide engine singletons: two
//! contexts in one process never share blocked IPs, counters or run totals.
//!
//! ```text
//! DefenseConfig ──► DefenseContext::from_config
//!                     ├─ RateLimiter        (Redis if reachable, else memory)
//!                     ├─ WasmSandbox        (limits from config)
//!                     ├─ ResponseController (edge + notifier, or simulation)
//!                     └─ KernelWatcher      (shares the controller)
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DefenseConfig;
use crate::ebpf::{KernelWatcher, WatcherConfig};
use crate::sandbox::WasmSandbox;
use crate::security::{CounterStore, RateLimiter, RedisCounterStore};
use crate::soar::{CloudflareEnforcer, EdgeEnforcer, Notifier, ResponseController, TelegramNotifier};

pub struct DefenseContext {
    pub rate_limiter: Arc<RateLimiter>,
    pub sandbox: Arc<WasmSandbox>,
    pub controller: Arc<ResponseController>,
    pub watcher: Arc<KernelWatcher>,
}

impl DefenseContext {
    /// Build every engine from `config`.
    ///
    /// Never fails: an unreachable rate-limit store degrades to in-memory
    /// counting and missing credentials put the controller in simulation.
    pub async fn from_config(config: &DefenseConfig) -> Self {
        let store: Option<Arc<dyn CounterStore>> = match &config.redis_url {
            Some(url) => match RedisCounterStore::connect(url).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, "Rate-limit store unreachable; counting in memory");
                    None
                }
            },
            None => None,
        };
        let rate_limiter = Arc::new(RateLimiter::new(store));

        let enforcer: Option<Arc<dyn EdgeEnforcer>> = config.edge.as_ref().map(|edge| {
            Arc::new(
                CloudflareEnforcer::new(&edge.api_token, &edge.zone_id)
                    .with_api_base(&edge.api_base),
            ) as Arc<dyn EdgeEnforcer>
        });
        let notifier: Option<Arc<dyn Notifier>> = config.notifier.as_ref().map(|n| {
            Arc::new(TelegramNotifier::new(&n.bot_token, &n.chat_id)) as Arc<dyn Notifier>
        });
        let controller = Arc::new(ResponseController::new(enforcer, notifier));

        let sandbox = Arc::new(WasmSandbox::new(config.sandbox));

        let watcher = Arc::new(KernelWatcher::new(
            Arc::clone(&controller),
            WatcherConfig {
                command: config.watch_command.clone(),
                ..WatcherConfig::default()
            },
        ));

        info!(
            enforcing = controller.is_enforcing(),
            shared_rate_limits = rate_limiter.has_store(),
            sandbox_runtime = sandbox.runtime_available(),
            "Defense context ready"
        );

        Self {
            rate_limiter,
            sandbox,
            controller,
            watcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_builds_simulation_context() {
        let ctx = DefenseContext::from_config(&DefenseConfig::default()).await;
        assert!(!ctx.controller.is_enforcing());
        assert!(!ctx.rate_limiter.has_store());
        assert_eq!(ctx.sandbox.stats().timeout_seconds, 10);
        assert_eq!(ctx.watcher.config().command[0], "kubectl");
    }

    #[tokio::test]
    async fn test_unusable_store_falls_back_to_memory() {
        let config = DefenseConfig {
            redis_url: Some("not a redis url".to_string()),
            ..DefenseConfig::default()
        };
        let ctx = DefenseContext::from_config(&config).await;
        assert!(!ctx.rate_limiter.has_store());
        assert!(ctx.rate_limiter.check("login", "198.51.100.1", 5, 60).await.allowed);
    }

    #[tokio::test]
    async fn test_contexts_do_not_share_state() {
        let a = DefenseContext::from_config(&DefenseConfig::default()).await;
        let b = DefenseContext::from_config(&DefenseConfig::default()).await;

        a.controller.registry().insert("203.0.113.7".parse().unwrap());
        assert!(a.controller.is_blocked("203.0.113.7"));
        assert!(!b.controller.is_blocked("203.0.113.7"));
    }
}
