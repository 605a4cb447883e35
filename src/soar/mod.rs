//! Autonomous response (SOAR): edge blocking on behalf of detectors
//!
//! ```text
//! ┌──────────────┐   block_ip(ip, reason)   ┌─────────────────────────────┐
//! │ KernelWatcher│ ───────────────────────► │  ResponseController         │
//! │ other        │                          │                             │
//! │ detectors    │                          │  1. validate (no internal)  │
//! └──────────────┘                          │  2. dedup (registry)        │
//!                                           │  3. per-IP lock             │
//!                                           │  4. EdgeEnforcer::block     │──► CDN/WAF API
//!                                           │  5. Notifier::notify (bg)   │──► bot API
//!                                           └─────────────────────────────┘
//! ```
//!
//! The enforcer and notifier are traits so detectors can be tested against
//! in-process fakes and the daemon can run in simulation mode without
//! credentials.

pub mod controller;
pub mod edge;
pub mod notify;
pub mod registry;
pub mod validate;

pub use controller::{BlockDecision, BlockOutcome, ResponseController};
pub use edge::{CloudflareEnforcer, EdgeEnforcer, EnforcementError};
pub use notify::{Notifier, NotifyError, TelegramNotifier};
pub use registry::BlockedIpRegistry;
pub use validate::{validate_block_target, IpRejection};
