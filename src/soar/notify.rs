//! Operator notifications via a messaging-bot API
//!
//! Notifications are best-effort. The controller never lets a failed send
//! change the outcome of a block.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Default Telegram Bot API base
pub const DEFAULT_BOT_API_BASE: &str = "https://api.telegram.org";

const NOTIFY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for notification delivery
#[derive(Debug)]
pub enum NotifyError {
    /// The bot API answered with a non-200 status
    Rejected(u16),
    /// The bot API could not be reached
    Transport(reqwest::Error),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Rejected(status) => write!(f, "Bot API rejected message ({})", status),
            NotifyError::Transport(e) => write!(f, "Bot API unreachable: {}", e),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Transport(e)
    }
}

/// Delivers a text message to the operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram bot client that posts to a single admin chat
#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: DEFAULT_BOT_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Point the client at a different API base (proxies, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .client
            .post(url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .timeout(NOTIFY_REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.status().as_u16()))
        }
    }
}
