//! Prometheus metrics for the defense engines
//!
//! All engines record into the default Prometheus registry. The registry is the
//! only process-wide state in the crate; engine state itself (blocked IPs,
//! rate-limit counters, run counters) lives on explicitly constructed instances.
//!
//! ```text
//! ResponseController ──► aegis_block_decisions_total{outcome}
//!                    └─► aegis_blocked_attacks_total
//! RateLimiter        ──► aegis_rate_limit_checks_total{bucket, allowed, backend}
//! WasmSandbox        ──► aegis_sandbox_runs_total{outcome}
//!                    └─► aegis_sandbox_run_duration_seconds
//! KernelWatcher      ──► aegis_watcher_events_total{kind}
//!                    └─► aegis_watcher_reconnects_total
//! ```

use std::convert::Infallible;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Response Controller
    // ─────────────────────────────────────────────────────────────────────────────

    /// Block decisions by outcome.
    ///
    /// Labels:
    /// - outcome: blocked, already_blocked, rejected, simulated, enforcement_failed
    pub static ref BLOCK_DECISIONS: CounterVec = register_counter_vec!(
        "aegis_block_decisions_total",
        "Edge block decisions by outcome",
        &["outcome"]
    ).expect("failed to register BLOCK_DECISIONS metric");

    /// IPs successfully enforced at the edge.
    pub static ref BLOCKED_ATTACKS: Counter = register_counter!(
        "aegis_blocked_attacks_total",
        "Attacks blocked at the edge since process start"
    ).expect("failed to register BLOCKED_ATTACKS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Rate Limiter
    // ─────────────────────────────────────────────────────────────────────────────

    /// Rate limit checks.
    ///
    /// Labels:
    /// - bucket: the admission bucket (e.g. "login")
    /// - allowed: "true" or "false"
    /// - backend: "store" or "memory"
    pub static ref RATE_LIMIT_CHECKS: CounterVec = register_counter_vec!(
        "aegis_rate_limit_checks_total",
        "Admission rate limit checks",
        &["bucket", "allowed", "backend"]
    ).expect("failed to register RATE_LIMIT_CHECKS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox runs by outcome code.
    pub static ref SANDBOX_RUNS: CounterVec = register_counter_vec!(
        "aegis_sandbox_runs_total",
        "Sandboxed parser runs by outcome",
        &["outcome"]
    ).expect("failed to register SANDBOX_RUNS metric");

    /// Wall-clock duration of sandboxed runs that reached the runtime.
    pub static ref SANDBOX_RUN_DURATION: Histogram = register_histogram!(
        "aegis_sandbox_run_duration_seconds",
        "Wall-clock duration of sandboxed parser runs",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("failed to register SANDBOX_RUN_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Kernel Event Watcher
    // ─────────────────────────────────────────────────────────────────────────────

    /// Watcher lines by classification.
    ///
    /// Labels:
    /// - kind: malformed, benign, violation, violation_no_ip
    pub static ref WATCHER_EVENTS: CounterVec = register_counter_vec!(
        "aegis_watcher_events_total",
        "Kernel event lines processed by classification",
        &["kind"]
    ).expect("failed to register WATCHER_EVENTS metric");

    /// Event source restarts.
    pub static ref WATCHER_RECONNECTS: Counter = register_counter!(
        "aegis_watcher_reconnects_total",
        "Kernel event source reconnect attempts"
    ).expect("failed to register WATCHER_RECONNECTS metric");
}

// ═══════════════════════════════════════════════════════════════════════════
// EXPOSITION
// ═══════════════════════════════════════════════════════════════════════════

/// Render every registered metric in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Serve `GET /metrics` on `listener` until `cancel` fires.
///
/// Any other path gets a 404. One task per connection, HTTP/1 only.
pub async fn serve_metrics(listener: TcpListener, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Metrics endpoint listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "metrics accept failed");
                    continue;
                }
            },
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_response))
                .await
            {
                tracing::debug!(%peer, error = %e, "metrics connection closed with error");
            }
        });
    }
}

async fn metrics_response(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = if req.method() == Method::GET && req.uri().path() == "/metrics" {
        Response::builder()
            .header(CONTENT_TYPE, TextEncoder::new().format_type())
            .body(Full::new(Bytes::from(gather_text())))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")))
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
