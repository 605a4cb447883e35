//! Kernel-level intrusion signals from eBPF policy enforcement
//!
//! The kernel-security agent (Tetragon) enforces tracing policies with eBPF
//! programs and exports every hit as JSON. This module consumes that export,
//! decides which events are policy violations, and hands the attacker's
//! address to the response controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Kernel Space (Tetragon eBPF programs)                      │
//! │                                                             │
//! │  kprobe / exec hooks ──► policy match ──► JSON export       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  one event per line
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  User Space (KernelWatcher)                                 │
//! │                                                             │
//! │  KernelEvent::parse   → malformed lines skipped             │
//! │  classify()           → PolicyViolation                     │
//! │  extract_attacker_ip  → ordered accessor list               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ResponseController::block_ip(ip, "eBPF Violation: ...")    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let watcher = KernelWatcher::new(controller, WatcherConfig::default());
//! let cancel = CancellationToken::new();
//! tokio::spawn(async move { watcher.run(cancel).await });
//! ```

pub mod event;
pub mod watcher;

pub use event::{classify, extract_attacker_ip, KernelEvent, PolicyViolation};
pub use watcher::{
    Backoff, KernelWatcher, LineOutcome, SessionStats, WatcherConfig, WatcherError,
    DEFAULT_WATCH_COMMAND,
};
