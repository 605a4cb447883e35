//! Edge enforcement client (CDN/WAF access rules)
//!
//! Blocks a single IP at the edge so its traffic never reaches application
//! infrastructure. The request shape is:
//!
//! ```text
//! POST {api_base}/zones/{zone_id}/firewall/access_rules/rules
//! Authorization: Bearer {api_token}
//!
//! { "mode": "block",
//!   "configuration": { "target": "ip", "value": "<ip>" },
//!   "notes": "AEGIS: <reason>" }
//! ```
//!
//! Only HTTP 200 counts as success. No retries happen here.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Default Cloudflare v4 API base
pub const DEFAULT_EDGE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Per-request timeout for the edge API
const EDGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for edge enforcement
#[derive(Debug)]
pub enum EnforcementError {
    /// The API answered with a non-200 status
    Rejected { status: u16, body: String },
    /// The API could not be reached
    Transport(reqwest::Error),
}

impl std::fmt::Display for EnforcementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnforcementError::Rejected { status, body } => {
                write!(f, "Edge API rejected request ({}): {}", status, body)
            }
            EnforcementError::Transport(e) => write!(f, "Edge API unreachable: {}", e),
        }
    }
}

impl std::error::Error for EnforcementError {}

impl From<reqwest::Error> for EnforcementError {
    fn from(e: reqwest::Error) -> Self {
        EnforcementError::Transport(e)
    }
}

/// Something that can block an IP at the network edge.
#[async_trait]
pub trait EdgeEnforcer: Send + Sync {
    /// Submit a block rule for `ip`. `Ok` means the rule is in place.
    async fn block(&self, ip: &IpAddr, notes: &str) -> Result<(), EnforcementError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct AccessRuleRequest<'a> {
    mode: &'static str,
    configuration: AccessRuleTarget,
    notes: &'a str,
}

#[derive(Serialize)]
struct AccessRuleTarget {
    target: &'static str,
    value: String,
}

/// Cloudflare firewall access-rule client
#[derive(Clone)]
pub struct CloudflareEnforcer {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
    zone_id: String,
}

impl CloudflareEnforcer {
    /// Create a client for `zone_id` authenticated with `api_token`.
    pub fn new(api_token: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: DEFAULT_EDGE_API_BASE.to_string(),
            api_token: api_token.into(),
            zone_id: zone_id.into(),
        }
    }

    /// Point the client at a different API base (proxies, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn rules_url(&self) -> String {
        format!(
            "{}/zones/{}/firewall/access_rules/rules",
            self.api_base, self.zone_id
        )
    }
}

#[async_trait]
impl EdgeEnforcer for CloudflareEnforcer {
    async fn block(&self, ip: &IpAddr, notes: &str) -> Result<(), EnforcementError> {
        let body = AccessRuleRequest {
            mode: "block",
            configuration: AccessRuleTarget {
                target: "ip",
                value: ip.to_string(),
            },
            notes,
        };

        let response = self
            .client
            .post(self.rules_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .timeout(EDGE_REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::OK {
            return Ok(());
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(EnforcementError::Rejected { status, body })
    }

    fn name(&self) -> &'static str {
        "cloudflare"
    }
}
