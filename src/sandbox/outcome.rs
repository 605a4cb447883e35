//! Sandbox run outcomes and their JSON rendering
//!
//! Upload handlers forward these verbatim, so the JSON shape is stable:
//!
//! ```text
//! Analyzed         {"status":"analyzed_in_sandbox","safe":true}
//! ModuleMissing    {"error":"wasm module missing","reason":...}
//! TargetMissing    {"error":"target file missing"}
//! FileTooLarge     {"error":"file_too_large","max_bytes":N}
//! NoEntryPoint     {"error":"no start function"}
//! Timeout          {"error":"sandbox_timeout","timeout_seconds":N,"malicious_payload_suspected":true}
//! OutOfMemory      {"error":"sandbox_oom","malicious_payload_suspected":true}
//! ExecutionFailed  {"error":"sandbox_execution_failed","malicious_payload_suspected":true,"detail":...}
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::{json, Value};

/// Longest `detail` string carried by ExecutionFailed
pub const MAX_DETAIL_CHARS: usize = 200;

/// Verdict of one sandboxed parser run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    /// Parser ran to completion through its entry point
    Analyzed,
    /// Module file or the sandbox runtime itself is unavailable
    ModuleMissing { reason: Option<String> },
    /// Target file does not exist
    TargetMissing,
    /// Target is over the size ceiling; nothing was executed
    FileTooLarge { max_bytes: u64 },
    /// Module has no `_start` export
    NoEntryPoint,
    /// Wall-clock deadline exceeded
    Timeout { timeout_seconds: u64 },
    /// Memory ceiling exceeded
    OutOfMemory,
    /// Any other compile, link, instantiate or trap failure
    ExecutionFailed { detail: String },
}

impl SandboxOutcome {
    pub(crate) fn failed(detail: impl std::fmt::Display) -> Self {
        SandboxOutcome::ExecutionFailed {
            detail: truncate_chars(&detail.to_string(), MAX_DETAIL_CHARS),
        }
    }

    /// Outcomes that indicate a hostile input rather than a benign failure
    pub fn is_suspected_malicious(&self) -> bool {
        matches!(
            self,
            SandboxOutcome::Timeout { .. }
                | SandboxOutcome::OutOfMemory
                | SandboxOutcome::ExecutionFailed { .. }
        )
    }

    /// Whether the parser completed normally
    pub fn is_safe(&self) -> bool {
        matches!(self, SandboxOutcome::Analyzed)
    }

    /// Stable short code for metrics labels and logs
    pub fn code(&self) -> &'static str {
        match self {
            SandboxOutcome::Analyzed => "analyzed_in_sandbox",
            SandboxOutcome::ModuleMissing { .. } => "wasm_module_missing",
            SandboxOutcome::TargetMissing => "target_file_missing",
            SandboxOutcome::FileTooLarge { .. } => "file_too_large",
            SandboxOutcome::NoEntryPoint => "no_start_function",
            SandboxOutcome::Timeout { .. } => "sandbox_timeout",
            SandboxOutcome::OutOfMemory => "sandbox_oom",
            SandboxOutcome::ExecutionFailed { .. } => "sandbox_execution_failed",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SandboxOutcome::Analyzed => json!({"status": "analyzed_in_sandbox", "safe": true}),
            SandboxOutcome::ModuleMissing { reason: Some(reason) } => {
                json!({"error": "wasm module missing", "reason": reason})
            }
            SandboxOutcome::ModuleMissing { reason: None } => json!({"error": "wasm module missing"}),
            SandboxOutcome::TargetMissing => json!({"error": "target file missing"}),
            SandboxOutcome::FileTooLarge { max_bytes } => {
                json!({"error": "file_too_large", "max_bytes": max_bytes})
            }
            SandboxOutcome::NoEntryPoint => json!({"error": "no start function"}),
            SandboxOutcome::Timeout { timeout_seconds } => json!({
                "error": "sandbox_timeout",
                "timeout_seconds": timeout_seconds,
                "malicious_payload_suspected": true
            }),
            SandboxOutcome::OutOfMemory => {
                json!({"error": "sandbox_oom", "malicious_payload_suspected": true})
            }
            SandboxOutcome::ExecutionFailed { detail } => json!({
                "error": "sandbox_execution_failed",
                "malicious_payload_suspected": true,
                "detail": detail
            }),
        }
    }
}

impl Serialize for SandboxOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One `run_parser` call. Ephemeral; only the run counter outlives it.
#[derive(Debug, Clone)]
pub struct SandboxRunRecord {
    pub module_path: PathBuf,
    pub target_path: PathBuf,
    pub outcome: SandboxOutcome,
    pub timed_out: bool,
    /// Wall-clock time from the call to the verdict
    pub duration: Duration,
}

/// Observability snapshot of a sandbox instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    pub runtime_available: bool,
    pub completed_runs: u64,
    pub timeout_seconds: u64,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shapes() {
        assert_eq!(
            SandboxOutcome::Analyzed.to_json(),
            json!({"status": "analyzed_in_sandbox", "safe": true})
        );
        assert_eq!(
            SandboxOutcome::FileTooLarge { max_bytes: 52_428_800 }.to_json(),
            json!({"error": "file_too_large", "max_bytes": 52_428_800u64})
        );
        assert_eq!(
            SandboxOutcome::Timeout { timeout_seconds: 10 }.to_json()["malicious_payload_suspected"],
            json!(true)
        );
        assert_eq!(
            SandboxOutcome::ModuleMissing { reason: None }.to_json(),
            json!({"error": "wasm module missing"})
        );
    }

    #[test]
    fn test_suspicion_flags() {
        assert!(SandboxOutcome::Timeout { timeout_seconds: 1 }.is_suspected_malicious());
        assert!(SandboxOutcome::OutOfMemory.is_suspected_malicious());
        assert!(!SandboxOutcome::Analyzed.is_suspected_malicious());
        assert!(!SandboxOutcome::FileTooLarge { max_bytes: 1 }.is_suspected_malicious());
        assert!(!SandboxOutcome::NoEntryPoint.is_suspected_malicious());
    }

    #[test]
    fn test_failure_detail_is_truncated() {
        let outcome = SandboxOutcome::failed("x".repeat(500));
        match &outcome {
            SandboxOutcome::ExecutionFailed { detail } => assert_eq!(detail.len(), MAX_DETAIL_CHARS),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(serde_json::to_value(&outcome).unwrap()["error"], "sandbox_execution_failed");
    }
}
