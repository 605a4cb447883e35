//! Aegis - defense automation for a web platform
//!
//! Four independent engines behind one explicitly constructed context:
//!
//! - `sandbox` - runs untrusted file parsers as WebAssembly under WASI with
//!   wall-clock and memory ceilings
//! - `ebpf` - consumes the kernel-security agent's event stream and
//!   escalates policy violations
//! - `soar` - validates, deduplicates and enforces edge IP blocks, then
//!   notifies operators
//! - `security` - fixed-window admission rate limiting over a shared store
//!   with an in-memory fallback
//!
//! Supporting modules:
//!
//! - `config` - environment configuration
//! - `context` - wiring of the engines from a config
//! - `metrics` - Prometheus metrics and the `/metrics` endpoint
//! - `tracing` - logging and optional OTLP span export
//!
//! # Quick Start
//!
//! ```ignore
//! use aegis::{DefenseConfig, DefenseContext};
//!
//! let config = DefenseConfig::from_env()?;
//! let ctx = DefenseContext::from_config(&config).await;
//!
//! let decision = ctx.rate_limiter.check("login", "198.51.100.4", 5, 60).await;
//! let blocked = ctx.controller.block_ip("203.0.113.1", "credential stuffing").await;
//! ```

pub mod config;
pub mod context;
pub mod ebpf;
pub mod metrics;
pub mod sandbox;
pub mod security;
pub mod soar;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, DefenseConfig};
pub use context::DefenseContext;
pub use ebpf::{KernelWatcher, WatcherConfig};
pub use sandbox::{SandboxLimits, SandboxOutcome, WasmSandbox};
pub use security::{RateLimitDecision, RateLimiter};
pub use soar::{BlockDecision, BlockOutcome, ResponseController};
