//! Kernel event watcher: stream → classify → extract → block
//!
//! Runs the kernel-security agent's log follower as a subprocess and reads its
//! stdout one line at a time:
//!
//! ```text
//! ┌────────────────────┐  stdout (NDJSON)  ┌──────────────────────────────┐
//! │ kubectl logs -f    │ ────────────────► │ KernelWatcher::run_stream    │
//! │ (tetragon)         │                   │   parse     → skip malformed │
//! └────────────────────┘                   │   classify  → skip benign    │
//!          ▲                               │   extract IP                 │
//!          │ restart with backoff          │   ResponseController::block  │
//!          │ 1s, 2s, 4s ... 30s            └──────────────────────────────┘
//!          └────────── EOF / error ◄───────────────────┘
//! ```
//!
//! The loop stops only when its cancellation token fires; the token is checked
//! at every read boundary and during backoff sleeps.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{classify, extract_attacker_ip, KernelEvent};
use crate::metrics::{WATCHER_EVENTS, WATCHER_RECONNECTS};
use crate::soar::ResponseController;

/// Default event source: follow Tetragon's export logs in kube-system
pub const DEFAULT_WATCH_COMMAND: &[&str] = &[
    "kubectl",
    "logs",
    "-n",
    "kube-system",
    "-l",
    "app.kubernetes.io/name=tetragon",
    "-f",
];

/// Longest event line kept in memory; longer lines are dropped as malformed
pub const MAX_EVENT_LINE_BYTES: usize = 1024 * 1024;

/// Error type for a single watcher session
#[derive(Debug)]
pub enum WatcherError {
    /// No command configured
    EmptyCommand,
    /// The event source could not be started
    Spawn(std::io::Error),
    /// Reading the event stream failed
    Read(std::io::Error),
    /// The event source exited unsuccessfully
    Exited(ExitStatus),
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::EmptyCommand => write!(f, "Watcher command is empty"),
            WatcherError::Spawn(e) => write!(f, "Failed to start event source: {}", e),
            WatcherError::Read(e) => write!(f, "Failed to read event stream: {}", e),
            WatcherError::Exited(status) => write!(f, "Event source exited: {}", status),
        }
    }
}

impl std::error::Error for WatcherError {}

/// Watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Program and arguments of the event source
    pub command: Vec<String>,
    /// Delay before the first restart
    pub initial_backoff: Duration,
    /// Ceiling for the doubling restart delay
    pub max_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_WATCH_COMMAND.iter().map(|s| s.to_string()).collect(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Restart delay: doubles per consecutive failure, resets after a clean session.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next session, given how the last one ended.
    pub fn next_delay(&mut self, last_session_ok: bool) -> Duration {
        if last_session_ok {
            self.current = self.initial;
            return self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// What happened to one line of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not JSON or not UTF-8; skipped
    Malformed,
    /// Valid event without a policy violation
    Benign,
    /// Violation with no resolvable source IP; logged only
    ViolationWithoutIp { policy: String, binary: String },
    /// Violation escalated to the response controller
    Escalated {
        policy: String,
        binary: String,
        ip: String,
        blocked: bool,
    },
}

/// Per-session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub lines: u64,
    pub malformed: u64,
    pub violations: u64,
    pub escalations: u64,
    pub blocked: u64,
}

impl SessionStats {
    fn record(&mut self, outcome: &LineOutcome) {
        self.lines += 1;
        match outcome {
            LineOutcome::Malformed => self.malformed += 1,
            LineOutcome::Benign => {}
            LineOutcome::ViolationWithoutIp { .. } => self.violations += 1,
            LineOutcome::Escalated { blocked, .. } => {
                self.violations += 1;
                self.escalations += 1;
                if *blocked {
                    self.blocked += 1;
                }
            }
        }
    }
}

/// Long-lived consumer of kernel-security events
pub struct KernelWatcher {
    controller: Arc<ResponseController>,
    config: WatcherConfig,
}

impl KernelWatcher {
    pub fn new(controller: Arc<ResponseController>, config: WatcherConfig) -> Self {
        Self { controller, config }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // run() - Reconnect loop
    // ═══════════════════════════════════════════════════════════════════════
    // Start the event source, drain it, and restart it after a backoff delay
    // whenever it ends. Returns only when `cancel` fires.
    // ═══════════════════════════════════════════════════════════════════════
    pub async fn run(&self, cancel: CancellationToken) {
        info!(command = ?self.config.command, "kernel event watcher started, waiting for anomalies");
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        while !cancel.is_cancelled() {
            let session_ok = match self.run_session(&cancel).await {
                Ok(stats) => {
                    warn!(?stats, "kernel event stream ended, reconnecting");
                    true
                }
                Err(e) => {
                    error!(error = %e, "kernel event watcher session failed");
                    false
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay(session_ok);
            WATCHER_RECONNECTS.inc();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("kernel event watcher stopped");
    }

    /// One subprocess lifetime: spawn, drain stdout, reap.
    async fn run_session(&self, cancel: &CancellationToken) -> Result<SessionStats, WatcherError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(WatcherError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WatcherError::Spawn)?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = "stderr", "{}", line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WatcherError::Spawn(std::io::Error::other("stdout not captured")))?;

        let stats = self.run_stream(stdout, cancel).await;

        if cancel.is_cancelled() {
            let _ = child.kill().await;
            return stats;
        }

        let stats = stats?;
        let status = child.wait().await.map_err(WatcherError::Read)?;
        if !status.success() {
            return Err(WatcherError::Exited(status));
        }
        Ok(stats)
    }

    /// Drain any newline-delimited event source until EOF or cancellation.
    ///
    /// Lines longer than [`MAX_EVENT_LINE_BYTES`] are discarded up to the next
    /// newline and counted as malformed; reading continues after them.
    pub async fn run_stream<R>(
        &self,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<SessionStats, WatcherError>
    where
        R: AsyncRead + Unpin,
    {
        let mut stats = SessionStats::default();
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_EVENT_LINE_BYTES);
        let mut frames = FramedRead::new(reader, codec);
        // FramedRead yields one None after a decode error, then resumes
        let mut after_error = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };

            let bytes = match frame {
                None if after_error => {
                    after_error = false;
                    continue;
                }
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!(max_bytes = MAX_EVENT_LINE_BYTES, "Dropping oversized event line");
                    WATCHER_EVENTS.with_label_values(&["malformed"]).inc();
                    stats.record(&LineOutcome::Malformed);
                    after_error = true;
                    continue;
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => return Err(WatcherError::Read(e)),
            };
            after_error = false;

            let outcome = match std::str::from_utf8(&bytes) {
                Ok(line) => self.handle_line(line).await,
                Err(_) => {
                    WATCHER_EVENTS.with_label_values(&["malformed"]).inc();
                    LineOutcome::Malformed
                }
            };
            stats.record(&outcome);
        }

        Ok(stats)
    }

    /// Classify one line and escalate it if it is an attributable violation.
    pub async fn handle_line(&self, line: &str) -> LineOutcome {
        let event = match KernelEvent::parse(line.trim()) {
            Ok(event) => event,
            Err(_) => {
                WATCHER_EVENTS.with_label_values(&["malformed"]).inc();
                return LineOutcome::Malformed;
            }
        };

        let violation = classify(&event);
        if !violation.is_violation {
            WATCHER_EVENTS.with_label_values(&["benign"]).inc();
            return LineOutcome::Benign;
        }

        error!(
            policy = %violation.policy_name,
            binary = %violation.binary_path,
            "kernel alert: policy violation"
        );

        let Some(ip) = extract_attacker_ip(&event) else {
            WATCHER_EVENTS.with_label_values(&["violation_no_ip"]).inc();
            warn!(policy = %violation.policy_name, "no source IP in kernel event");
            return LineOutcome::ViolationWithoutIp {
                policy: violation.policy_name,
                binary: violation.binary_path,
            };
        };

        WATCHER_EVENTS.with_label_values(&["violation"]).inc();
        warn!(%ip, policy = %violation.policy_name, "escalating to response controller");

        let reason = format!("eBPF Violation: {}", violation.policy_name);
        let blocked = self.controller.block_ip(ip, &reason).await;

        LineOutcome::Escalated {
            policy: violation.policy_name,
            binary: violation.binary_path,
            ip: ip.to_string(),
            blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher() -> KernelWatcher {
        KernelWatcher::new(
            Arc::new(ResponseController::simulation()),
            WatcherConfig::default(),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay(false).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_resets_after_clean_session() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        b.next_delay(false);
        b.next_delay(false);
        assert_eq!(b.next_delay(true), Duration::from_secs(1));
        assert_eq!(b.next_delay(false), Duration::from_secs(1));
        assert_eq!(b.next_delay(false), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_handle_line_classification() {
        let w = watcher();

        assert_eq!(w.handle_line("garbage").await, LineOutcome::Malformed);
        assert_eq!(w.handle_line("{}").await, LineOutcome::Benign);
        assert_eq!(
            w.handle_line(r#"{"process_exec":{"policy_name":"p"}}"#).await,
            LineOutcome::ViolationWithoutIp {
                policy: "p".to_string(),
                binary: "unknown".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_run_stream_skips_noise() {
        let w = watcher();
        let input: &[u8] = b"not json\n\xff\xfe\n{}\n{\"process_exec\":{\"policy_name\":\"p\",\"source_ip\":\"203.0.113.1\"}}\n";

        let stats = w.run_stream(input, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.escalations, 1);
        // Simulation mode never reports a block
        assert_eq!(stats.blocked, 0);
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped_and_reading_continues() {
        let w = watcher();
        let mut input = vec![b'x'; MAX_EVENT_LINE_BYTES + 10];
        input.push(b'\n');
        input.extend_from_slice(
            b"{\"process_exec\":{\"policy_name\":\"p\",\"source_ip\":\"203.0.113.1\"}}\n",
        );

        let stats = w.run_stream(input.as_slice(), &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.violations, 1);
    }

    #[tokio::test]
    async fn test_run_stream_stops_on_cancel() {
        let w = watcher();
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            async move { w.run_stream(BufReader::new(reader), &cancel).await }
        };
        let handle = tokio::spawn(task);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.lines, 0);
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled_during_backoff() {
        let config = WatcherConfig {
            command: vec!["/nonexistent/event-source".to_string()],
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        };
        let w = KernelWatcher::new(Arc::new(ResponseController::simulation()), config);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { w.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
