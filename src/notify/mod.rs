pub mod antiflutter;
pub mod dispatch;
pub mod message;
pub mod operator;
pub mod ratelimit;
pub mod telegram;

use std::time::Duration;

use thiserror::Error;

use crate::models::ChatId;

pub use dispatch::{DeliveryResult, DispatchCfg, DispatchReport, Dispatcher};
pub use ratelimit::{RateLimitCfg, RateLimiter};
pub use telegram::TelegramMessenger;

/// How the messaging platform refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network trouble, timeouts, 5xx. Retry with backoff.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Platform throttling (HTTP 429). Retry after the hinted delay.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// The chat cannot be reached any more: bot blocked, chat deleted, kicked.
    #[error("chat unreachable: {0}")]
    PermanentUnreachable(String),
    /// This one message was refused (bad markup, too long). Not retried.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_) | SendError::RateLimited { .. })
    }
}

/// "Send text to chat" capability of the messaging platform.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), SendError>;
    fn name(&self) -> &'static str;
}
