//! Integration tests for the defense engines wired through DefenseContext
//!
//! The edge API is a local wiremock server; the kernel event source is either
//! an in-memory stream or a `cat` subprocess over a temp file.

use std::io::Write;
use std::time::Duration;

use aegis::config::EdgeCredentials;
use aegis::{BlockOutcome, DefenseConfig, DefenseContext, SandboxOutcome};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RULES_PATH: &str = "/zones/zone-1/firewall/access_rules/rules";

const VIOLATION: &str = r#"{"process_exec":{"policy_name":"block-shells","process":{"binary":"/bin/sh"},"source":{"ip":"203.0.113.1"}}}"#;

async fn enforcing_context(server: &MockServer) -> DefenseContext {
    let config = DefenseConfig {
        edge: Some(EdgeCredentials {
            api_token: "test-token".to_string(),
            zone_id: "zone-1".to_string(),
            api_base: server.uri(),
        }),
        ..DefenseConfig::default()
    };
    DefenseContext::from_config(&config).await
}

async fn mount_edge(server: &MockServer, status: u16, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(RULES_PATH))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"success": status == 200})))
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Repeated violations from one address reach the edge API exactly once
#[tokio::test]
async fn test_kernel_violation_is_blocked_once() {
    let server = MockServer::start().await;
    mount_edge(&server, 200, 1).await;
    let ctx = enforcing_context(&server).await;

    let input = format!("{}\n{{}}\n{}\n", VIOLATION, VIOLATION);
    let stats = ctx
        .watcher
        .run_stream(input.as_bytes(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.violations, 2);
    assert_eq!(stats.blocked, 2);
    assert_eq!(ctx.controller.blocked_attacks(), 1);
    assert!(ctx.controller.is_blocked("203.0.113.1"));
}

/// An edge rejection leaves the address unblocked so a later event retries
#[tokio::test]
async fn test_edge_rejection_is_retryable() {
    let server = MockServer::start().await;
    mount_edge(&server, 500, 2).await;
    let ctx = enforcing_context(&server).await;

    let first = ctx.controller.decide("203.0.113.1", "probe").await;
    assert_eq!(first.outcome, BlockOutcome::EnforcementFailed);
    assert!(!ctx.controller.is_blocked("203.0.113.1"));

    let second = ctx.controller.decide("203.0.113.1", "probe").await;
    assert_eq!(second.outcome, BlockOutcome::EnforcementFailed);
    assert_ne!(first.id, second.id);
}

/// Internal addresses never reach the edge API
#[tokio::test]
async fn test_internal_targets_are_refused() {
    let server = MockServer::start().await;
    mount_edge(&server, 200, 0).await;
    let ctx = enforcing_context(&server).await;

    for ip in ["127.0.0.1", "10.0.0.5", "192.168.1.100", "::1", "not-an-ip", ""] {
        assert!(!ctx.controller.block_ip(ip, "test").await, "{ip} was blocked");
    }
    assert_eq!(ctx.controller.blocked_attacks(), 0);
}

/// The full reconnecting watcher drives a real subprocess
#[cfg(unix)]
#[tokio::test]
async fn test_watcher_subprocess_end_to_end() {
    let server = MockServer::start().await;
    mount_edge(&server, 200, 1).await;

    let mut events = tempfile::NamedTempFile::new().unwrap();
    writeln!(events, "garbage").unwrap();
    writeln!(events, "{}", VIOLATION).unwrap();
    events.flush().unwrap();

    let config = DefenseConfig {
        edge: Some(EdgeCredentials {
            api_token: "test-token".to_string(),
            zone_id: "zone-1".to_string(),
            api_base: server.uri(),
        }),
        watch_command: vec!["cat".to_string(), events.path().display().to_string()],
        ..DefenseConfig::default()
    };
    let ctx = DefenseContext::from_config(&config).await;

    let cancel = CancellationToken::new();
    let watcher = ctx.watcher.clone();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { watcher.run(cancel).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !ctx.controller.is_blocked("203.0.113.1") {
        assert!(tokio::time::Instant::now() < deadline, "watcher never blocked");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("watcher did not stop on cancel")
        .unwrap();
}

/// Simulation mode: detections are logged but nothing is enforced
#[tokio::test]
async fn test_simulation_context() {
    let ctx = DefenseContext::from_config(&DefenseConfig::default()).await;
    let decision = ctx.controller.decide("203.0.113.9", "test").await;
    assert_eq!(decision.outcome, BlockOutcome::Simulated);
    assert!(!ctx.controller.is_blocked("203.0.113.9"));
}

/// Admission limits: 5 per window, then 429-style denials with headers
#[tokio::test]
async fn test_login_rate_limit() {
    let ctx = DefenseContext::from_config(&DefenseConfig::default()).await;

    for _ in 0..5 {
        assert!(ctx.rate_limiter.check("login", "198.51.100.4", 5, 60).await.allowed);
    }
    let denied = ctx.rate_limiter.check("login", "198.51.100.4", 5, 60).await;
    assert!(!denied.allowed);
    assert_eq!(denied.info.remaining, 0);

    let headers = denied.info.http_headers();
    assert_eq!(headers[0], ("X-RateLimit-Limit", "5".to_string()));

    // Other buckets and identities are unaffected
    assert!(ctx.rate_limiter.check("register", "198.51.100.4", 3, 60).await.allowed);
    assert!(ctx.rate_limiter.check("login", "198.51.100.5", 5, 60).await.allowed);
}

/// Oversized uploads are refused before the runtime is touched
#[tokio::test]
async fn test_sandbox_refuses_oversized_upload() {
    let ctx = DefenseContext::from_config(&DefenseConfig::default()).await;
    let dir = tempfile::tempdir().unwrap();

    let module = dir.path().join("parser.wat");
    std::fs::write(&module, r#"(module (func (export "_start")))"#).unwrap();
    let target = dir.path().join("upload.bin");
    std::fs::File::create(&target)
        .unwrap()
        .set_len(aegis::sandbox::MAX_TARGET_BYTES + 1)
        .unwrap();

    let record = ctx.sandbox.run_parser_async(module, target).await;
    assert_eq!(
        record.outcome,
        SandboxOutcome::FileTooLarge {
            max_bytes: 50 * 1024 * 1024
        }
    );
    assert_eq!(ctx.sandbox.stats().completed_runs, 0);
}
