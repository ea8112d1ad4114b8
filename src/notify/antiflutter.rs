// src/notify/antiflutter.rs
use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Cooldown gate to prevent alert spam, tracked per alert key.
/// - First alert for a key always allowed.
/// - Inside cooldown, alerts for the same key are suppressed.
/// - State is updated explicitly via `record_alert` after a successful send.
#[derive(Debug, Clone)]
pub struct AntiFlutter<K> {
    cooldown: ChronoDuration,
    last_alert: HashMap<K, DateTime<Utc>>,
}

impl<K: Eq + Hash + Clone> AntiFlutter<K> {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Check if we may alert at `now` for `key`. Does NOT mutate state.
    pub fn should_alert(&self, key: &K, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(key) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    /// Record that an alert was sent at `now` for `key`.
    pub fn record_alert(&mut self, key: K, now: DateTime<Utc>) {
        self.last_alert.insert(key, now);
    }

    /// Forget `key`, e.g. after the condition cleared.
    pub fn reset(&mut self, key: &K) {
        self.last_alert.remove(key);
    }
}
