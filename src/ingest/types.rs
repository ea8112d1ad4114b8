// src/ingest/types.rs
use chrono::{DateTime, Utc};
use thiserror::Error;

/// One feed item as the provider saw it, before normalization.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RawEntry {
    pub title: Option<String>,
    pub url: Option<String>,
    /// Feed-assigned item id (Pepper: the numeric thread id).
    pub guid: Option<String>,
    pub price: Option<String>,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Canonical deal record. Only `id` carries identity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Deal {
    pub id: String,
    pub title: String,
    pub price: Option<String>,
    pub merchant: Option<String>,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network, timeout, 5xx or throttling. Next cycle tries again.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Malformed body or a client error that will not fix itself.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    /// Current feed content in feed order. An empty vec is a valid answer.
    async fn fetch_latest(&self) -> Result<Vec<RawEntry>, FetchError>;
    fn name(&self) -> &str;
}
