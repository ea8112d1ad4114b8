//! SQLite-backed [`StateStore`].
//!
//! One pooled connection only: all writes are serialized through it, which is
//! the single-writer discipline the pipeline relies on.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::models::{ChatId, Subscriber, SubscriberStatus};
use crate::store::{StateStore, StoreError};

pub const DB_FILE_NAME: &str = "deal-notifier.sqlite";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS seen_ids (
        id TEXT PRIMARY KEY NOT NULL,
        first_seen INTEGER NOT NULL,
        committed_at INTEGER NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_seen_ids_first_seen ON seen_ids (first_seen)",
    "CREATE TABLE IF NOT EXISTS subscribers (
        chat_id INTEGER PRIMARY KEY NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
    in_memory: bool,
}

impl SqliteStore {
    /// Opens (creating if missing) `<data_dir>/deal-notifier.sqlite`.
    #[tracing::instrument(level = "info", skip_all, fields(data_dir = %data_dir.display()))]
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| StoreError::Open(format!("creating {}: {e}", data_dir.display())))?;
        let path = data_dir.join(DB_FILE_NAME);

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let store = Self::connect(options, false).await?;
        tracing::info!(target: "store", path = %path.display(), "state store opened");
        Ok(store)
    }

    /// Private in-memory database; lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::connect(options, true).await
    }

    async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            // An in-memory database dies with its connection, so never recycle it.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self { pool, in_memory };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(|e| {
                tracing::error!(target: "store", error = %e, "schema migration failed");
                StoreError::Open(e.to_string())
            })?;
        }
        Ok(())
    }
}

fn ts_from_row(row: &SqliteRow, col: &str, table: &'static str) -> Result<DateTime<Utc>, StoreError> {
    let secs: i64 = row.try_get(col)?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("{col} out of range: {secs}"),
    })
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber, StoreError> {
    let chat_id: i64 = row.try_get("chat_id")?;
    let status: String = row.try_get("status")?;
    let status = SubscriberStatus::from_str(&status).map_err(|detail| StoreError::Corrupt {
        table: "subscribers",
        detail,
    })?;
    Ok(Subscriber {
        chat_id: ChatId(chat_id),
        status,
        created_at: ts_from_row(row, "created_at", "subscribers")?,
        updated_at: ts_from_row(row, "updated_at", "subscribers")?,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn reserve_seen(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "INSERT INTO seen_ids (id, first_seen, committed_at) VALUES (?, ?, NULL)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn is_seen(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM seen_ids WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn seen_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_ids")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn commit_seen(&self, ids: &[String], now: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE seen_ids SET committed_at = ? WHERE id = ? AND committed_at IS NULL")
                .bind(now.timestamp())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reconcile_reserved(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM seen_ids WHERE committed_at IS NULL ORDER BY first_seen, id",
        )
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("UPDATE seen_ids SET committed_at = ? WHERE committed_at IS NULL")
            .bind(now.timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "DELETE FROM seen_ids WHERE committed_at IS NOT NULL AND first_seen < ?",
        )
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn upsert_subscriber(
        &self,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError> {
        let row = sqlx::query(
            "INSERT INTO subscribers (chat_id, status, created_at, updated_at)
             VALUES (?, 'active', ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET status = 'active', updated_at = excluded.updated_at
             RETURNING chat_id, status, created_at, updated_at",
        )
        .bind(chat_id.0)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?;
        subscriber_from_row(&row)
    }

    async fn remove_subscriber(&self, chat_id: ChatId) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM subscribers WHERE chat_id = ?")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_subscriber_status(
        &self,
        chat_id: ChatId,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE subscribers SET status = ?, updated_at = ? WHERE chat_id = ?")
            .bind(status.as_str())
            .bind(now.timestamp())
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            tracing::debug!(target: "store", %chat_id, "status update for unknown subscriber");
        }
        Ok(())
    }

    async fn subscriber(&self, chat_id: ChatId) -> Result<Option<Subscriber>, StoreError> {
        let row = sqlx::query(
            "SELECT chat_id, status, created_at, updated_at FROM subscribers WHERE chat_id = ?",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query(
            "SELECT chat_id, status, created_at, updated_at FROM subscribers ORDER BY chat_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query(
            "SELECT chat_id, status, created_at, updated_at FROM subscribers
             WHERE status = 'active' ORDER BY chat_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    #[tracing::instrument(skip(self), level = "info")]
    async fn close(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Ok(());
        }
        if !self.in_memory {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await?;
        }
        self.pool.close().await;
        tracing::info!(target: "store", "state store closed");
        Ok(())
    }
}
