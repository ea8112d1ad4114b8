//! Out-of-band alerts to the operator chat. Subscribers never see these.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::antiflutter::AntiFlutter;
use super::Messenger;
use crate::clock::Clock;
use crate::models::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Fetch,
    Store,
    Panic,
    Startup,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Fetch => "fetch",
            AlertKind::Store => "store",
            AlertKind::Panic => "panic",
            AlertKind::Startup => "startup",
        }
    }
}

pub struct OperatorAlerts {
    messenger: Arc<dyn Messenger>,
    chat_id: Option<ChatId>,
    clock: Arc<dyn Clock>,
    gate: Mutex<AntiFlutter<AlertKind>>,
}

impl OperatorAlerts {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        chat_id: Option<ChatId>,
        clock: Arc<dyn Clock>,
        cooldown_secs: i64,
    ) -> Self {
        Self {
            messenger,
            chat_id,
            clock,
            gate: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.chat_id.is_some()
    }

    /// Sends `text` unless an alert of the same kind went out within the
    /// cooldown. Returns whether a message was sent.
    pub async fn alert(&self, kind: AlertKind, text: &str) -> bool {
        let Some(chat_id) = self.chat_id else {
            return false;
        };
        let now = self.clock.now();
        {
            let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            if !gate.should_alert(&kind, now) {
                debug!(target: "dispatch", kind = kind.as_str(), "operator alert suppressed");
                return false;
            }
        }

        let body = format!(
            "⚠️ deal-notifier [{}]\n{}",
            kind.as_str(),
            html_escape::encode_text(text)
        );
        match self.messenger.send_text(chat_id, &body).await {
            Ok(()) => {
                self.gate
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_alert(kind, now);
                true
            }
            Err(e) => {
                warn!(target: "dispatch", kind = kind.as_str(), error = %e, "operator alert failed");
                false
            }
        }
    }

    /// Re-arms `kind` once the condition behind it cleared.
    pub fn clear(&self, kind: AlertKind) {
        self.gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset(&kind);
    }
}
