//! Sandboxed execution of untrusted file parsers
//!
//! Uploaded files are never parsed in-process. A parser compiled to
//! WebAssembly runs against the file inside a throwaway WASI instance with a
//! read-only view of exactly one directory.
//!
//! ```text
//! run_parser(module, target)
//!   │
//!   ├─ module exists?          no ──► ModuleMissing
//!   ├─ target exists?          no ──► TargetMissing
//!   ├─ size <= 50 MiB?         no ──► FileTooLarge      (runtime never touched)
//!   │
//!   └─ worker thread ─────────────────────────────────────────────┐
//!        fresh Store   one memory, capped (GuestLimiter)          │
//!        WASI p1       argv = [parser.wasm, /workspace/<name>]    │
//!                      /workspace = target's directory, RO        │
//!        epoch deadline ──► Trap::Interrupt ──► Timeout           │
//!        async timeout  ──► host call dropped ► Timeout           │
//!        grow over cap  ──────────────────────► OutOfMemory       │
//!        _start missing ──────────────────────► NoEntryPoint      │
//!        _start returns / exit(0) ────────────► Analyzed          │
//!   ◄───────────────── recv_timeout(timeout + grace) ─────────────┘
//! ```
//!
//! Building without the `wasm` feature keeps the same API; every run that
//! passes the file checks reports `ModuleMissing`.

pub mod outcome;
pub mod runner;
#[cfg(feature = "wasm")]
mod runtime;

pub use outcome::{SandboxOutcome, SandboxRunRecord, SandboxStats, MAX_DETAIL_CHARS};
pub use runner::{
    SandboxError, SandboxLimits, WasmSandbox, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT, MAX_TARGET_BYTES,
};
