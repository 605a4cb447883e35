//! Kernel security events and policy-violation classification
//!
//! Events arrive as one JSON object per line from the kernel-security agent
//! (Tetragon). Only a handful of nested fields matter; everything else is
//! ignored, so schema additions on the agent side never break parsing.
//!
//! ```text
//! {
//!   "process_exec": {
//!     "policy_name": "block-shells",
//!     "process": { "binary": "/bin/sh", "pod": { "pod_ip": "..." } },
//!     "source": { "ip": "..." },
//!     "source_ip": "..."
//!   },
//!   "process_kprobe": { "source": { "ip": "..." }, "source_ip": "..." }
//! }
//! ```

use serde_json::Value;

/// Binary reported when the event does not name one
pub const UNKNOWN_BINARY: &str = "unknown";

/// One decoded event line. Transient, never stored.
#[derive(Debug, Clone)]
pub struct KernelEvent(Value);

impl KernelEvent {
    /// Decode one line of the event stream.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line).map(KernelEvent)
    }

    fn process_exec(&self) -> Option<&Value> {
        self.0.get("process_exec").filter(|v| v.is_object())
    }

    fn process_kprobe(&self) -> Option<&Value> {
        self.0.get("process_kprobe").filter(|v| v.is_object())
    }
}

impl From<Value> for KernelEvent {
    fn from(value: Value) -> Self {
        KernelEvent(value)
    }
}

/// Classification of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub is_violation: bool,
    pub policy_name: String,
    pub binary_path: String,
}

impl PolicyViolation {
    fn none() -> Self {
        Self {
            is_violation: false,
            policy_name: String::new(),
            binary_path: String::new(),
        }
    }
}

/// An event is a violation iff `process_exec` is an object carrying a
/// non-empty `policy_name`.
pub fn classify(event: &KernelEvent) -> PolicyViolation {
    let Some(exec) = event.process_exec() else {
        return PolicyViolation::none();
    };

    let policy = non_empty(exec.get("policy_name")).unwrap_or_default();
    if policy.is_empty() {
        return PolicyViolation::none();
    }

    let binary = non_empty(exec.get("process").and_then(|p| p.get("binary")))
        .unwrap_or(UNKNOWN_BINARY);

    PolicyViolation {
        is_violation: true,
        policy_name: policy.to_string(),
        binary_path: binary.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attacker IP accessors, tried in order until one yields a non-empty string
// ─────────────────────────────────────────────────────────────────────────────

type IpAccessor = fn(&KernelEvent) -> Option<&str>;

fn exec_source_ip(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_exec()?.get("source")?.get("ip"))
}

fn exec_source_ip_flat(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_exec()?.get("source_ip"))
}

fn exec_pod_ip(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_exec()?.get("process")?.get("pod")?.get("pod_ip"))
}

fn exec_pod_ip_short(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_exec()?.get("process")?.get("pod")?.get("ip"))
}

fn kprobe_source_ip(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_kprobe()?.get("source")?.get("ip"))
}

fn kprobe_source_ip_flat(e: &KernelEvent) -> Option<&str> {
    non_empty(e.process_kprobe()?.get("source_ip"))
}

const IP_ACCESSORS: [IpAccessor; 6] = [
    exec_source_ip,
    exec_source_ip_flat,
    exec_pod_ip,
    exec_pod_ip_short,
    kprobe_source_ip,
    kprobe_source_ip_flat,
];

/// Resolve the attacker's network identity from an event.
pub fn extract_attacker_ip(event: &KernelEvent) -> Option<&str> {
    IP_ACCESSORS.iter().find_map(|accessor| accessor(event))
}

/// A trimmed, non-empty string value
fn non_empty(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> KernelEvent {
        KernelEvent::from(value)
    }

    #[test]
    fn test_violation_with_source_ip() {
        let e = KernelEvent::parse(
            r#"{"process_exec":{"policy_name":"block-shells","process":{"binary":"/bin/sh"},"source":{"ip":"192.168.1.100"}}}"#,
        )
        .unwrap();

        let v = classify(&e);
        assert!(v.is_violation);
        assert_eq!(v.policy_name, "block-shells");
        assert_eq!(v.binary_path, "/bin/sh");
        assert_eq!(extract_attacker_ip(&e), Some("192.168.1.100"));
    }

    #[test]
    fn test_empty_object_is_benign() {
        let e = KernelEvent::parse("{}").unwrap();
        assert!(!classify(&e).is_violation);
        assert_eq!(extract_attacker_ip(&e), None);
    }

    #[test]
    fn test_missing_binary_defaults_to_unknown() {
        let e = event(json!({"process_exec": {"policy_name": "p"}}));
        let v = classify(&e);
        assert!(v.is_violation);
        assert_eq!(v.binary_path, UNKNOWN_BINARY);
    }

    #[test]
    fn test_blank_policy_is_not_a_violation() {
        for e in [
            event(json!({"process_exec": {"policy_name": "   "}})),
            event(json!({"process_exec": {"policy_name": null}})),
            event(json!({"process_exec": "not-a-map"})),
            event(json!({"process_kprobe": {"policy_name": "p"}})),
            event(json!([1, 2, 3])),
        ] {
            assert!(!classify(&e).is_violation);
        }
    }

    #[test]
    fn test_ip_precedence() {
        let full = json!({
            "process_exec": {
                "source": {"ip": "203.0.113.1"},
                "source_ip": "203.0.113.2",
                "process": {"pod": {"pod_ip": "203.0.113.3", "ip": "203.0.113.4"}}
            },
            "process_kprobe": {"source": {"ip": "203.0.113.5"}, "source_ip": "203.0.113.6"}
        });
        assert_eq!(extract_attacker_ip(&event(full.clone())), Some("203.0.113.1"));

        let mut v = full;
        v["process_exec"]["source"]["ip"] = json!("  ");
        assert_eq!(extract_attacker_ip(&event(v.clone())), Some("203.0.113.2"));

        v["process_exec"]["source_ip"] = json!(42);
        assert_eq!(extract_attacker_ip(&event(v.clone())), Some("203.0.113.3"));

        v["process_exec"]["process"]["pod"]["pod_ip"] = Value::Null;
        assert_eq!(extract_attacker_ip(&event(v.clone())), Some("203.0.113.4"));

        v["process_exec"] = json!("gone");
        assert_eq!(extract_attacker_ip(&event(v.clone())), Some("203.0.113.5"));

        v["process_kprobe"]["source"] = json!({});
        assert_eq!(extract_attacker_ip(&event(v)), Some("203.0.113.6"));
    }

    #[test]
    fn test_ip_is_trimmed() {
        let e = event(json!({"process_exec": {"source_ip": " 198.51.100.9 "}}));
        assert_eq!(extract_attacker_ip(&e), Some("198.51.100.9"));
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let e = KernelEvent::parse(
            r#"{"time":"2024-01-01T00:00:00Z","node_name":"n1","process_exec":{"policy_name":"p","extra":{"a":1}}}"#,
        )
        .unwrap();
        assert!(classify(&e).is_violation);
    }

    #[test]
    fn test_malformed_line_fails_to_parse() {
        assert!(KernelEvent::parse("{not json").is_err());
        assert!(KernelEvent::parse("").is_err());
    }
}
