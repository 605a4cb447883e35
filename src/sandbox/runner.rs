//! WasmSandbox: precondition checks, bounded execution, run accounting

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::outcome::{SandboxOutcome, SandboxRunRecord, SandboxStats};
use crate::metrics::{SANDBOX_RUNS, SANDBOX_RUN_DURATION};

/// Hard ceiling on target file size (50 MiB)
pub const MAX_TARGET_BYTES: u64 = 50 * 1024 * 1024;

/// Default wall-clock limit per run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default guest memory ceiling in MiB
pub const DEFAULT_MEMORY_MB: u64 = 64;

/// Error type for sandbox infrastructure (never for guest behavior)
#[derive(Debug)]
pub enum SandboxError {
    /// Engine, linker or epoch ticker could not be set up
    RuntimeInit(String),
    /// The per-run worker thread could not be started
    Worker(std::io::Error),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::RuntimeInit(e) => write!(f, "Failed to initialize WebAssembly runtime: {}", e),
            SandboxError::Worker(e) => write!(f, "Failed to spawn sandbox worker: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Resource limits applied to every run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub max_target_bytes: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_mb: DEFAULT_MEMORY_MB,
            max_target_bytes: MAX_TARGET_BYTES,
        }
    }
}

impl SandboxLimits {
    pub fn memory_bytes(&self) -> usize {
        usize::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// Runs untrusted parser modules against uploaded files.
///
/// Safe to share across threads; each run executes on its own worker with a
/// fresh store, and the only shared mutable state is the run counter.
pub struct WasmSandbox {
    limits: SandboxLimits,
    completed_runs: AtomicU64,
    #[cfg(feature = "wasm")]
    runtime: Option<super::runtime::WasmRuntime>,
}

impl WasmSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            completed_runs: AtomicU64::new(0),
            #[cfg(feature = "wasm")]
            runtime: match super::runtime::WasmRuntime::new() {
                Ok(runtime) => Some(runtime),
                Err(e) => {
                    warn!(error = %e, "WebAssembly runtime unavailable; sandbox disabled");
                    None
                }
            },
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    #[cfg(feature = "wasm")]
    pub fn runtime_available(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.is_ticking())
    }

    #[cfg(not(feature = "wasm"))]
    pub fn runtime_available(&self) -> bool {
        false
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            runtime_available: self.runtime_available(),
            completed_runs: self.completed_runs(),
            timeout_seconds: self.limits.timeout.as_secs(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RUN: preconditions first, then the bounded guest call
    // ═══════════════════════════════════════════════════════════════════════

    /// Execute `module_path` against `target_path` under the configured
    /// limits. Blocks the calling thread for at most the timeout plus a small
    /// grace period. Never panics on guest misbehavior.
    pub fn run_parser(&self, module_path: &Path, target_path: &Path) -> SandboxRunRecord {
        let started = Instant::now();
        let outcome = self.evaluate(module_path, target_path, started);
        let duration = started.elapsed();

        if outcome.is_safe() {
            let runs = self.completed_runs.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                target = %target_path.display(),
                runs,
                elapsed_ms = duration.as_millis() as u64,
                "Sandbox analysis completed"
            );
        } else if outcome.is_suspected_malicious() {
            error!(
                target = %target_path.display(),
                verdict = outcome.code(),
                "Sandbox run aborted; malicious payload suspected"
            );
        } else {
            warn!(
                target = %target_path.display(),
                verdict = outcome.code(),
                "Sandbox run refused"
            );
        }

        SANDBOX_RUNS.with_label_values(&[outcome.code()]).inc();
        SANDBOX_RUN_DURATION.observe(duration.as_secs_f64());

        SandboxRunRecord {
            module_path: module_path.to_path_buf(),
            target_path: target_path.to_path_buf(),
            timed_out: matches!(outcome, SandboxOutcome::Timeout { .. }),
            outcome,
            duration,
        }
    }

    /// [`run_parser`](Self::run_parser) on the blocking pool, for async callers.
    pub async fn run_parser_async(
        self: &Arc<Self>,
        module_path: PathBuf,
        target_path: PathBuf,
    ) -> SandboxRunRecord {
        let sandbox = Arc::clone(self);
        let (module, target) = (module_path.clone(), target_path.clone());
        match tokio::task::spawn_blocking(move || sandbox.run_parser(&module, &target)).await {
            Ok(record) => record,
            Err(e) => SandboxRunRecord {
                module_path,
                target_path,
                outcome: SandboxOutcome::failed(format!("sandbox task failed: {}", e)),
                timed_out: false,
                duration: Duration::ZERO,
            },
        }
    }

    fn evaluate(&self, module_path: &Path, target_path: &Path, started: Instant) -> SandboxOutcome {
        if !module_path.is_file() {
            return SandboxOutcome::ModuleMissing { reason: None };
        }
        let size = match std::fs::metadata(target_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return SandboxOutcome::TargetMissing,
        };
        if size > self.limits.max_target_bytes {
            return SandboxOutcome::FileTooLarge {
                max_bytes: self.limits.max_target_bytes,
            };
        }
        self.execute(module_path, target_path, started)
    }

    #[cfg(feature = "wasm")]
    fn execute(&self, module_path: &Path, target_path: &Path, started: Instant) -> SandboxOutcome {
        let Some(runtime) = &self.runtime else {
            return SandboxOutcome::ModuleMissing {
                reason: Some("WebAssembly runtime unavailable".to_string()),
            };
        };
        runtime.run(super::runtime::RunJob {
            module_path: module_path.to_path_buf(),
            target_path: target_path.to_path_buf(),
            timeout: self.limits.timeout,
            memory_bytes: self.limits.memory_bytes(),
            started,
        })
    }

    #[cfg(not(feature = "wasm"))]
    fn execute(&self, _module_path: &Path, _target_path: &Path, _started: Instant) -> SandboxOutcome {
        SandboxOutcome::ModuleMissing {
            reason: Some("built without the wasm feature".to_string()),
        }
    }
}

impl Default for WasmSandbox {
    fn default() -> Self {
        Self::new(SandboxLimits::default())
    }
}
