//! Telegram Bot API client: `sendMessage` for deliveries, `getUpdates` for the
//! command poller. Failures are mapped onto [`SendError`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{Messenger, SendError};
use crate::models::ChatId;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Descriptions of 400 answers that mean the chat is gone for good.
const UNREACHABLE_HINTS: &[&str] = &[
    "chat not found",
    "user is deactivated",
    "bot was kicked",
    "bot was blocked",
    "bot is not a member",
    "have no rights to send",
    "not enough rights",
    "group chat was upgraded",
];

#[derive(Clone)]
pub struct TelegramMessenger {
    api_base: String,
    token: String,
    client: Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
}

impl TelegramMessenger {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    /// Long-polls for incoming updates newer than `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        poll_secs: u64,
    ) -> Result<Vec<Update>, SendError> {
        let mut query = vec![("timeout", poll_secs.to_string())];
        if let Some(o) = offset {
            query.push(("offset", o.to_string()));
        }
        let rsp = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .timeout(self.timeout + Duration::from_secs(poll_secs))
            .send()
            .await
            .map_err(request_error)?;

        let status = rsp.status();
        let header_retry = retry_after_header(&rsp);
        let body: Option<ApiResponse<Vec<Update>>> = rsp.json().await.ok();
        match body {
            Some(api) if status.is_success() && api.ok => Ok(api.result.unwrap_or_default()),
            other => Err(classify_failure(status, other.as_ref(), header_retry)),
        }
    }
}

fn request_error(e: reqwest::Error) -> SendError {
    // The token is part of the URL; never let it reach the logs.
    let e = e.without_url();
    if e.is_timeout() {
        SendError::Transient(format!("timeout: {e}"))
    } else {
        SendError::Transient(format!("request failed: {e}"))
    }
}

fn retry_after_header(rsp: &reqwest::Response) -> Option<Duration> {
    rsp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a non-OK Bot API answer onto the delivery error taxonomy.
pub(crate) fn classify_failure<T>(
    status: StatusCode,
    body: Option<&ApiResponse<T>>,
    header_retry: Option<Duration>,
) -> SendError {
    let description = body
        .and_then(|b| b.description.clone())
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let hinted = body
                .and_then(|b| b.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);
            SendError::RateLimited {
                retry_after: hinted.or(header_retry),
            }
        }
        StatusCode::FORBIDDEN => SendError::PermanentUnreachable(description),
        StatusCode::BAD_REQUEST => {
            let lower = description.to_ascii_lowercase();
            if UNREACHABLE_HINTS.iter().any(|h| lower.contains(h)) {
                SendError::PermanentUnreachable(description)
            } else {
                SendError::Rejected(description)
            }
        }
        // A bad token is a deployment problem, not a property of the chat.
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
            SendError::Transient(format!("bot token rejected: {description}"))
        }
        s if s.is_server_error() => SendError::Transient(description),
        s if s.is_success() => SendError::Transient(format!("unexpected answer: {description}")),
        _ => SendError::Rejected(description),
    }
}

#[async_trait::async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), SendError> {
        let payload = SendMessage {
            chat_id: chat_id.0,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: false,
        };

        let rsp = self
            .client
            .post(self.method_url("sendMessage"))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(request_error)?;

        let status = rsp.status();
        if status.is_success() {
            return Ok(());
        }
        let header_retry = retry_after_header(&rsp);
        let body: Option<ApiResponse<serde_json::Value>> = rsp.json().await.ok();
        Err(classify_failure(status, body.as_ref(), header_retry))
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(description: &str, retry_after: Option<u64>) -> ApiResponse<serde_json::Value> {
        ApiResponse {
            ok: false,
            result: None,
            description: Some(description.to_string()),
            parameters: retry_after.map(|s| ResponseParameters {
                retry_after: Some(s),
            }),
        }
    }

    #[test]
    fn throttling_carries_retry_after() {
        let b = body("Too Many Requests: retry after 7", Some(7));
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some(&b), None),
            SendError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        let no_body: Option<&ApiResponse<serde_json::Value>> = None;
        assert_eq!(
            classify_failure(
                StatusCode::TOO_MANY_REQUESTS,
                no_body,
                Some(Duration::from_secs(3))
            ),
            SendError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn blocked_and_missing_chats_are_unreachable() {
        let blocked = body("Forbidden: bot was blocked by the user", None);
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, Some(&blocked), None),
            SendError::PermanentUnreachable(_)
        ));
        let missing = body("Bad Request: chat not found", None);
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, Some(&missing), None),
            SendError::PermanentUnreachable(_)
        ));
    }

    #[test]
    fn other_bad_requests_are_rejections() {
        let b = body("Bad Request: can't parse entities", None);
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, Some(&b), None),
            SendError::Rejected(_)
        ));
    }

    #[test]
    fn server_errors_and_bad_tokens_are_transient() {
        let b = body("Internal Server Error", None);
        assert!(classify_failure(StatusCode::BAD_GATEWAY, Some(&b), None).is_retryable());
        let t = body("Unauthorized", None);
        assert!(classify_failure(StatusCode::UNAUTHORIZED, Some(&t), None).is_retryable());
    }

    #[test]
    fn method_url_has_no_double_slash() {
        let m = TelegramMessenger::new("123:abc").with_api_base("http://localhost:9/");
        assert_eq!(m.method_url("sendMessage"), "http://localhost:9/bot123:abc/sendMessage");
    }
}
