//! Send pacing for the messaging platform.
//!
//! Two limits apply to every send:
//! - per chat: consecutive messages to one chat are at least `per_chat_interval` apart;
//! - global: any two messages are at least `1s / global_per_sec` apart.
//!
//! Callers reserve a slot and sleep until it; excess sends queue up instead of
//! being dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::ChatId;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitCfg {
    pub per_chat_interval: Duration,
    pub global_per_sec: u32,
}

impl Default for RateLimitCfg {
    /// Telegram: about one message per second per chat, 30/s overall.
    fn default() -> Self {
        Self {
            per_chat_interval: Duration::from_secs(1),
            global_per_sec: 25,
        }
    }
}

impl RateLimitCfg {
    fn global_spacing(&self) -> Duration {
        Duration::from_secs(1) / self.global_per_sec.max(1)
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Last reserved slot per chat.
    last_per_chat: HashMap<ChatId, Instant>,
    /// Reserved global slots, pairwise at least `global_spacing` apart.
    global: BTreeSet<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateLimitCfg,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitCfg) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn cfg(&self) -> RateLimitCfg {
        self.cfg
    }

    /// Reserves the earliest slot >= `now` that satisfies both limits.
    pub fn reserve(&self, chat_id: ChatId, now: Instant) -> Instant {
        let spacing = self.cfg.global_spacing();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Forget state that can no longer constrain anything.
        let chat_horizon = now.checked_sub(self.cfg.per_chat_interval).unwrap_or(now);
        inner.last_per_chat.retain(|_, last| *last > chat_horizon);
        let global_horizon = now.checked_sub(spacing).unwrap_or(now);
        inner.global = inner.global.split_off(&global_horizon);

        let mut slot = match inner.last_per_chat.get(&chat_id) {
            Some(last) => (*last + self.cfg.per_chat_interval).max(now),
            None => now,
        };

        // First gap in the global schedule that is wide enough.
        let lower = slot.checked_sub(spacing).unwrap_or(slot);
        for &taken in inner.global.range(lower..) {
            if taken >= slot + spacing {
                break;
            }
            if taken + spacing > slot {
                slot = taken + spacing;
            }
        }

        inner.global.insert(slot);
        inner.last_per_chat.insert(chat_id, slot);
        slot
    }

    /// Waits until a send to `chat_id` is allowed. Cancel-safe: dropping the
    /// future only wastes the reserved slot.
    pub async fn acquire(&self, chat_id: ChatId) {
        let slot = self.reserve(chat_id, Instant::now());
        tokio::time::sleep_until(slot).await;
    }

    /// Number of chats currently tracked (bounded by recent activity).
    pub fn tracked_chats(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_per_chat
            .len()
    }
}
