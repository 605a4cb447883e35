//! Wasmtime-backed execution of untrusted parser modules
//!
//! One [`WasmRuntime`] per sandbox: a shared engine with epoch interruption
//! and an async WASI preview1 linker. Every call gets a fresh store, so nothing
//! a module does survives into the next call.
//!
//! Two clocks bound a run. The epoch deadline traps guest code that spins; the
//! async timeout drops a guest parked in a host call such as `poll_oneoff`.
//! Either way the worker thread ends with the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, ResourceLimiter, Store, Trap};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::outcome::SandboxOutcome;
use super::runner::SandboxError;

/// Guest directory the target's parent is mounted at, read-only
pub const GUEST_MOUNT: &str = "/workspace";

/// argv[0] presented to the guest
pub const GUEST_ARGV0: &str = "parser.wasm";

/// Epoch tick period; the timeout resolution of a run
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-store object counts. One module, one linear memory.
const MAX_INSTANCES: usize = 1;
const MAX_MEMORIES: usize = 1;
const MAX_TABLES: usize = 4;

/// Largest table a guest may create or grow to, in elements
const MAX_TABLE_ELEMENTS: u32 = 100_000;

/// Per-store state: WASI context plus the resource ceilings
struct SandboxState {
    wasi: WasiP1Ctx,
    limiter: GuestLimiter,
}

/// Resource ceilings for one store.
///
/// A refused memory request is recorded here, so the verdict reads the flag
/// instead of wasmtime's error text.
struct GuestLimiter {
    memory_bytes: usize,
    memory_exceeded: bool,
}

impl GuestLimiter {
    fn new(memory_bytes: usize) -> Self {
        Self {
            memory_bytes,
            memory_exceeded: false,
        }
    }
}

impl ResourceLimiter for GuestLimiter {
    // Called for initial memories too, with current = 0
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.memory_bytes {
            self.memory_exceeded = true;
            return Err(wasmtime::Error::msg(format!(
                "guest asked for {} bytes of memory, ceiling is {}",
                desired, self.memory_bytes
            )));
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }

    fn instances(&self) -> usize {
        MAX_INSTANCES
    }

    fn tables(&self) -> usize {
        MAX_TABLES
    }

    fn memories(&self) -> usize {
        MAX_MEMORIES
    }
}

/// Inputs of one run, moved onto the worker thread
pub(crate) struct RunJob {
    pub module_path: PathBuf,
    pub target_path: PathBuf,
    pub timeout: Duration,
    pub memory_bytes: usize,
    pub started: Instant,
}

pub(crate) struct WasmRuntime {
    engine: Engine,
    linker: Arc<Linker<SandboxState>>,
    ticker: EpochTicker,
    active_workers: Arc<AtomicUsize>,
}

impl WasmRuntime {
    pub fn new() -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.async_support(true);
        // A second memory would get its own ceiling
        config.wasm_multi_memory(false);

        let engine = Engine::new(&config).map_err(|e| SandboxError::RuntimeInit(e.to_string()))?;
        let mut linker: Linker<SandboxState> = Linker::new(&engine);
        preview1::add_to_linker_async(&mut linker, |s: &mut SandboxState| &mut s.wasi)
            .map_err(|e| SandboxError::RuntimeInit(e.to_string()))?;

        let ticker = EpochTicker::start(engine.clone())
            .map_err(|e| SandboxError::RuntimeInit(format!("epoch ticker: {}", e)))?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            ticker,
            active_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a dedicated worker thread and wait at most the job's
    /// timeout (plus a few ticks of slack) for its verdict.
    ///
    /// The worker enforces the deadline itself; the bounded wait covers phases
    /// neither clock can interrupt, such as compiling a pathological module.
    pub fn run(&self, job: RunJob) -> SandboxOutcome {
        let timeout = job.timeout;
        let timeout_seconds = timeout.as_secs().max(1);
        let wait = timeout.saturating_sub(job.started.elapsed()) + EPOCH_TICK * 5;

        let engine = self.engine.clone();
        let linker = Arc::clone(&self.linker);
        let active = WorkerGuard::enter(&self.active_workers);
        let (tx, rx) = std::sync::mpsc::sync_channel(1);

        let spawned = std::thread::Builder::new()
            .name("aegis-sandbox".to_string())
            .spawn(move || {
                let _active = active;
                let outcome = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(execute(&engine, &linker, &job)),
                    Err(e) => SandboxOutcome::failed(SandboxError::Worker(e)),
                };
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return SandboxOutcome::failed(SandboxError::Worker(e));
        }

        match rx.recv_timeout(wait) {
            Ok(SandboxOutcome::Timeout { .. }) => SandboxOutcome::Timeout { timeout_seconds },
            Ok(outcome) => outcome,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    active_workers = self.active_workers(),
                    "Sandbox worker missed its deadline; abandoning it"
                );
                SandboxOutcome::Timeout { timeout_seconds }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                SandboxOutcome::failed("sandbox worker terminated without a verdict")
            }
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.is_running()
    }

    /// Worker threads that have not finished yet
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }
}

/// Counts a worker as live until dropped on its thread
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER: compile, link, instantiate, call _start
// ═══════════════════════════════════════════════════════════════════════════

async fn execute(engine: &Engine, linker: &Linker<SandboxState>, job: &RunJob) -> SandboxOutcome {
    let module = match Module::from_file(engine, &job.module_path) {
        Ok(module) => module,
        Err(e) => return classify_error(&e, false),
    };

    let (host_dir, guest_file) = guest_view(&job.target_path);
    let mut builder = WasiCtxBuilder::new();
    builder.arg(GUEST_ARGV0).arg(&guest_file);
    if let Err(e) = builder.preopened_dir(&host_dir, GUEST_MOUNT, DirPerms::READ, FilePerms::READ) {
        return SandboxOutcome::failed(format!("failed to mount target directory: {}", e));
    }

    let state = SandboxState {
        wasi: builder.build_p1(),
        limiter: GuestLimiter::new(job.memory_bytes),
    };
    let mut store = Store::new(engine, state);
    store.limiter(|s| &mut s.limiter);

    // Budget already spent compiling counts against the deadline
    let remaining = job.timeout.saturating_sub(job.started.elapsed());
    store.set_epoch_deadline(ticks_for(remaining));

    debug!(guest_file = %guest_file, "Invoking parser entry point");
    let result = tokio::time::timeout(remaining, invoke(&mut store, linker, &module)).await;

    match result {
        Err(_elapsed) => SandboxOutcome::Timeout { timeout_seconds: 0 },
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => classify_error(&e, store.data().limiter.memory_exceeded),
    }
}

async fn invoke(
    store: &mut Store<SandboxState>,
    linker: &Linker<SandboxState>,
    module: &Module,
) -> wasmtime::Result<SandboxOutcome> {
    let instance = linker.instantiate_async(&mut *store, module).await?;

    let Some(start) = instance.get_func(&mut *store, "_start") else {
        return Ok(SandboxOutcome::NoEntryPoint);
    };
    let start = match start.typed::<(), ()>(&*store) {
        Ok(start) => start,
        Err(e) => return Ok(SandboxOutcome::failed(e)),
    };

    start.call_async(&mut *store, ()).await?;
    Ok(SandboxOutcome::Analyzed)
}

fn classify_error(err: &wasmtime::Error, memory_exceeded: bool) -> SandboxOutcome {
    if memory_exceeded {
        return SandboxOutcome::OutOfMemory;
    }
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return if exit.0 == 0 {
            SandboxOutcome::Analyzed
        } else {
            SandboxOutcome::failed(format!("parser exited with status {}", exit.0))
        };
    }
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
        return SandboxOutcome::Timeout { timeout_seconds: 0 };
    }
    SandboxOutcome::failed(format!("{:#}", err))
}

/// Host directory to preopen and the guest path of the target inside it
fn guest_view(target: &Path) -> (PathBuf, String) {
    let host_dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (host_dir, format!("{}/{}", GUEST_MOUNT, name))
}

fn ticks_for(budget: Duration) -> u64 {
    let tick = EPOCH_TICK.as_millis().max(1);
    let ticks = budget.as_millis().div_ceil(tick);
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

// ═══════════════════════════════════════════════════════════════════════════
// EPOCH TICKER: advances the engine epoch until the runtime is dropped
// ═══════════════════════════════════════════════════════════════════════════

struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("aegis-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
