// src/config/app.rs
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::models::ChatId;
use crate::notify::{DispatchCfg, RateLimitCfg};

pub const CONFIG_ENV: &str = "DEAL_NOTIFIER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/deal-notifier.toml";

/// Placeholder meaning "take the value from the environment".
const ENV_PLACEHOLDER: &str = "ENV";

const MIN_FETCH_INTERVAL_SECS: u64 = 10;

/// String that never shows up in `Debug` output.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Redacted(pub String);

impl Redacted {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

/// One polled Pepper feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedCfg {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Single-feed shorthand, used when `feeds` is empty.
    pub feed_url: String,
    pub feed_name: String,
    /// `[[feeds]]` tables in the file or `FEEDS=name=url,name=url`.
    pub feeds: Vec<FeedCfg>,
    /// "ENV" means: read from TELEGRAM_TOKEN.
    pub telegram_token: Redacted,
    pub telegram_api_base: String,
    pub operator_chat_id: Option<i64>,
    pub data_dir: PathBuf,
    pub fetch_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub per_chat_interval_ms: u64,
    pub global_msgs_per_sec: u32,
    pub max_send_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub send_timeout_secs: u64,
    pub dispatch_concurrency: usize,
    /// 0 keeps seen ids forever.
    pub seen_retention_days: u32,
    pub operator_alert_cooldown_secs: i64,
    /// HTTP status surface is off unless set.
    pub http_bind: Option<String>,
    pub commands_enabled: bool,
    pub command_poll_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://www.mydealz.de/rss/alle".into(),
            feed_name: "mydealz".into(),
            feeds: Vec::new(),
            telegram_token: Redacted::default(),
            telegram_api_base: crate::notify::telegram::DEFAULT_API_BASE.into(),
            operator_chat_id: None,
            data_dir: PathBuf::from("data"),
            fetch_interval_secs: 300,
            fetch_timeout_secs: 15,
            per_chat_interval_ms: 1_000,
            global_msgs_per_sec: 25,
            max_send_attempts: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            send_timeout_secs: 10,
            dispatch_concurrency: 8,
            seen_retention_days: 0,
            operator_alert_cooldown_secs: 3_600,
            http_bind: None,
            commands_enabled: true,
            command_poll_secs: 30,
        }
    }
}

impl AppConfig {
    /// File (if any) -> environment overrides -> sanitize.
    /// File lookup: $DEAL_NOTIFIER_CONFIG, then `config/deal-notifier.toml`.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(p) => {
                let path = PathBuf::from(p);
                if !path.exists() {
                    bail!("{CONFIG_ENV} points to non-existent path {}", path.display());
                }
                Self::load_from_file(&path)?
            }
            Err(_) => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.finalize()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Applies environment-style overrides; `get` returns the raw value for a key.
    pub fn apply_overrides<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = text("FEED_URL") {
            self.feed_url = v;
        }
        if let Some(v) = text("FEED_NAME") {
            self.feed_name = v;
        }
        if let Some(v) = text("FEEDS") {
            match parse_feed_list(&v) {
                Some(feeds) => self.feeds = feeds,
                None => warn!(key = "FEEDS", value = %v, "ignoring unparsable override"),
            }
        }
        if let Some(v) = text("TELEGRAM_TOKEN") {
            self.telegram_token = Redacted(v);
        }
        if let Some(v) = text("TELEGRAM_API_BASE") {
            self.telegram_api_base = v;
        }
        if let Some(v) = text("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = text("HTTP_BIND") {
            self.http_bind = Some(v);
        }

        set_parsed(&text, "OWN_ID", |v: i64| self.operator_chat_id = Some(v));
        set_parsed(&text, "FETCH_INTERVAL_SECS", |v| self.fetch_interval_secs = v);
        set_parsed(&text, "FETCH_TIMEOUT_SECS", |v| self.fetch_timeout_secs = v);
        set_parsed(&text, "PER_CHAT_INTERVAL_MS", |v| self.per_chat_interval_ms = v);
        set_parsed(&text, "GLOBAL_MSGS_PER_SEC", |v| self.global_msgs_per_sec = v);
        set_parsed(&text, "MAX_SEND_ATTEMPTS", |v| self.max_send_attempts = v);
        set_parsed(&text, "BACKOFF_BASE_MS", |v| self.backoff_base_ms = v);
        set_parsed(&text, "BACKOFF_MAX_MS", |v| self.backoff_max_ms = v);
        set_parsed(&text, "SEND_TIMEOUT_SECS", |v| self.send_timeout_secs = v);
        set_parsed(&text, "DISPATCH_CONCURRENCY", |v| self.dispatch_concurrency = v);
        set_parsed(&text, "SEEN_RETENTION_DAYS", |v| self.seen_retention_days = v);
        set_parsed(&text, "OPERATOR_ALERT_COOLDOWN_SECS", |v| {
            self.operator_alert_cooldown_secs = v
        });
        set_parsed(&text, "COMMAND_POLL_SECS", |v| self.command_poll_secs = v);

        if let Some(v) = text("COMMANDS_ENABLED") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.commands_enabled = true,
                "0" | "false" | "no" | "off" => self.commands_enabled = false,
                _ => warn!(key = "COMMANDS_ENABLED", value = %v, "ignoring unparsable override"),
            }
        }
    }

    /// Clamps out-of-range values and checks required fields.
    pub fn finalize(mut self) -> Result<Self> {
        let token = self.telegram_token.expose().trim();
        if token.is_empty() || token.eq_ignore_ascii_case(ENV_PLACEHOLDER) {
            bail!("missing TELEGRAM_TOKEN");
        }
        self.telegram_token = Redacted(token.to_string());

        if self.feeds.is_empty() {
            self.feeds = vec![FeedCfg {
                name: self.feed_name.clone(),
                url: self.feed_url.clone(),
            }];
        }
        let mut names = HashSet::new();
        for feed in &mut self.feeds {
            feed.name = feed.name.trim().to_string();
            feed.url = feed.url.trim().to_string();
            if feed.name.is_empty() {
                bail!("feed {:?} has no name", feed.url);
            }
            if !names.insert(feed.name.clone()) {
                bail!("feed name {:?} is used twice", feed.name);
            }
            let parsed = url::Url::parse(&feed.url)
                .map_err(|e| anyhow!("invalid url for feed {}: {:?}: {e}", feed.name, feed.url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("feed {} must be http(s), got {}", feed.name, parsed.scheme());
            }
        }

        self.fetch_interval_secs = self.fetch_interval_secs.max(MIN_FETCH_INTERVAL_SECS);
        self.fetch_timeout_secs = self.fetch_timeout_secs.max(1);
        self.send_timeout_secs = self.send_timeout_secs.max(1);
        self.max_send_attempts = self.max_send_attempts.max(1);
        self.dispatch_concurrency = self.dispatch_concurrency.max(1);
        self.global_msgs_per_sec = self.global_msgs_per_sec.max(1);
        self.backoff_max_ms = self.backoff_max_ms.max(self.backoff_base_ms);
        self.operator_alert_cooldown_secs = self.operator_alert_cooldown_secs.max(0);
        if self.http_bind.as_deref().is_some_and(|b| b.trim().is_empty()) {
            self.http_bind = None;
        }
        Ok(self)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn operator_chat(&self) -> Option<ChatId> {
        self.operator_chat_id.map(ChatId)
    }

    pub fn rate_limit_cfg(&self) -> RateLimitCfg {
        RateLimitCfg {
            per_chat_interval: Duration::from_millis(self.per_chat_interval_ms),
            global_per_sec: self.global_msgs_per_sec,
        }
    }

    pub fn dispatch_cfg(&self) -> DispatchCfg {
        DispatchCfg {
            max_attempts: self.max_send_attempts,
            base_backoff: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            concurrency: self.dispatch_concurrency,
        }
    }
}

/// `mydealz=https://...,preisjaeger=https://...`; `None` if any entry is malformed.
fn parse_feed_list(raw: &str) -> Option<Vec<FeedCfg>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, url) = part.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            (!name.is_empty() && !url.is_empty()).then(|| FeedCfg {
                name: name.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

fn set_parsed<T, G, S>(text: &G, key: &str, mut set: S)
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
    S: FnMut(T),
{
    if let Some(raw) = text(key) {
        match raw.parse::<T>() {
            Ok(v) => set(v),
            Err(_) => warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}
