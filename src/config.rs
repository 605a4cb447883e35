//! Environment configuration for the defense daemon
//!
//! Every setting has a working default; a missing variable never fails
//! startup. Only values that are present but malformed are errors.
//!
//! ```text
//! WASM_TIMEOUT_SEC        sandbox wall-clock limit (s)        10
//! WASM_MAX_MEMORY_MB      sandbox memory ceiling (MiB)        64
//! CLOUDFLARE_API_TOKEN    edge API credential                 unset -> simulation
//! CLOUDFLARE_ZONE_ID      edge zone                           unset -> simulation
//! CLOUDFLARE_API_BASE     edge API base URL                   api.cloudflare.com
//! TELEGRAM_BOT_TOKEN      notification bot token              unset -> no alerts
//! TELEGRAM_ALERT_CHAT_ID  notification chat                   unset -> no alerts
//! AEGIS_TELEGRAM_NOTIFY   alerts only when "1"                1
//! REDIS_URL               shared rate-limit store             unset -> in-memory
//! AEGIS_WATCH_CMD         event source command line           kubectl ... tetragon
//! AEGIS_METRICS_ADDR      /metrics listen address             unset -> disabled
//! AEGIS_LOG_JSON          JSON log lines when "1"             0
//! AEGIS_OTLP_ENDPOINT     OTLP trace export endpoint          unset -> console only
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::ebpf::DEFAULT_WATCH_COMMAND;
use crate::sandbox::{SandboxLimits, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT};
use crate::soar::edge::DEFAULT_EDGE_API_BASE;

/// A variable that is set but cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {}={:?}: {}", var, value, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Edge API credentials; both halves are required to enforce.
#[derive(Clone, PartialEq, Eq)]
pub struct EdgeCredentials {
    pub api_token: String,
    pub zone_id: String,
    pub api_base: String,
}

impl fmt::Debug for EdgeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeCredentials")
            .field("api_token", &"<redacted>")
            .field("zone_id", &self.zone_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NotifierCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for NotifierCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierCredentials")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Everything the daemon reads from its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefenseConfig {
    pub sandbox: SandboxLimits,
    pub edge: Option<EdgeCredentials>,
    pub notifier: Option<NotifierCredentials>,
    pub redis_url: Option<String>,
    pub watch_command: Vec<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_json: bool,
    pub otlp_endpoint: Option<String>,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxLimits::default(),
            edge: None,
            notifier: None,
            redis_url: None,
            watch_command: default_watch_command(),
            metrics_addr: None,
            log_json: false,
            otlp_endpoint: None,
        }
    }
}

impl DefenseConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let timeout_secs = parse_positive("WASM_TIMEOUT_SEC", get("WASM_TIMEOUT_SEC"))?
            .unwrap_or(DEFAULT_TIMEOUT.as_secs());
        let memory_mb = parse_positive("WASM_MAX_MEMORY_MB", get("WASM_MAX_MEMORY_MB"))?
            .unwrap_or(DEFAULT_MEMORY_MB);

        let edge = match (get("CLOUDFLARE_API_TOKEN"), get("CLOUDFLARE_ZONE_ID")) {
            (Some(api_token), Some(zone_id)) => Some(EdgeCredentials {
                api_token,
                zone_id,
                api_base: get("CLOUDFLARE_API_BASE")
                    .unwrap_or_else(|| DEFAULT_EDGE_API_BASE.to_string()),
            }),
            _ => None,
        };

        let notify_enabled = get("AEGIS_TELEGRAM_NOTIFY").map_or(true, |v| is_on(&v));
        let notifier = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_ALERT_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) if notify_enabled => {
                Some(NotifierCredentials { bot_token, chat_id })
            }
            _ => None,
        };

        let watch_command = match get("AEGIS_WATCH_CMD") {
            Some(cmd) => split_command(&cmd),
            None => default_watch_command(),
        };

        let metrics_addr = match get("AEGIS_METRICS_ADDR") {
            Some(raw) => Some(raw.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                var: "AEGIS_METRICS_ADDR",
                value: raw.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            sandbox: SandboxLimits {
                timeout: Duration::from_secs(timeout_secs),
                memory_mb,
                ..SandboxLimits::default()
            },
            edge,
            notifier,
            redis_url: get("REDIS_URL"),
            watch_command,
            metrics_addr,
            log_json: get("AEGIS_LOG_JSON").is_some_and(|v| is_on(&v)),
            otlp_endpoint: get("AEGIS_OTLP_ENDPOINT"),
        })
    }
}

fn parse_positive(var: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(Some(n)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Switches are on only for the literal "1"
fn is_on(value: &str) -> bool {
    value.trim() == "1"
}

fn default_watch_command() -> Vec<String> {
    DEFAULT_WATCH_COMMAND.iter().map(|s| s.to_string()).collect()
}

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}
