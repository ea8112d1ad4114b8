//! Persistent State Store: the seen-set and the subscriber table.
//!
//! Every other component goes through [`StateStore`]; nothing mutates these
//! tables directly. Only the dedup step writes `seen_ids`, the dispatcher and
//! the command poller write `subscribers`.

pub mod error;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{ChatId, Subscriber, SubscriberStatus};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically inserts `id` into the seen-set in reserved state.
    /// Returns `true` iff the id was not present before.
    async fn reserve_seen(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn is_seen(&self, id: &str) -> Result<bool, StoreError>;

    async fn seen_count(&self) -> Result<u64, StoreError>;

    /// Marks reserved ids whose fan-out finished as committed.
    async fn commit_seen(&self, ids: &[String], now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Commits ids left in reserved state by an interrupted run and returns them.
    /// They stay seen; nothing is re-sent.
    async fn reconcile_reserved(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Removes committed ids first seen before `cutoff`. Returns the number removed.
    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Registers a chat as active, reactivating it if it was suspended.
    async fn upsert_subscriber(
        &self,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError>;

    /// Returns `true` if a row was removed.
    async fn remove_subscriber(&self, chat_id: ChatId) -> Result<bool, StoreError>;

    async fn set_subscriber_status(
        &self,
        chat_id: ChatId,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn subscriber(&self, chat_id: ChatId) -> Result<Option<Subscriber>, StoreError>;

    async fn subscribers(&self) -> Result<Vec<Subscriber>, StoreError>;

    async fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self
            .subscribers()
            .await?
            .into_iter()
            .filter(Subscriber::is_active)
            .collect())
    }

    /// Flushes pending writes and releases the handle.
    async fn close(&self) -> Result<(), StoreError>;
}
