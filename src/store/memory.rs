//! In-memory [`StateStore`] with the same semantics as the SQLite one.
//! Used by tests; `fail_next` injects store outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ChatId, Subscriber, SubscriberStatus};
use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone)]
struct SeenRow {
    first_seen: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashMap<String, SeenRow>,
    subscribers: BTreeMap<ChatId, Subscriber>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pass_before_fail: AtomicUsize,
    fail_next: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` operations return `StoreError::OperationFailed`.
    pub fn fail_next(&self, n: usize) {
        self.fail_after(0, n);
    }

    /// Lets `ok` operations through, then fails the following `n`.
    pub fn fail_after(&self, ok: usize, n: usize) {
        self.pass_before_fail.store(ok, Ordering::SeqCst);
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ids still in reserved state (not committed).
    pub fn reserved_ids(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .seen
            .iter()
            .filter(|(_, row)| row.committed_at.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.fail_next.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        let passed = self
            .pass_before_fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if passed.is_ok() {
            return Ok(());
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::OperationFailed("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn reserve_seen(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        if inner.seen.contains_key(id) {
            return Ok(false);
        }
        inner.seen.insert(
            id.to_string(),
            SeenRow {
                first_seen: now,
                committed_at: None,
            },
        );
        Ok(true)
    }

    async fn is_seen(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.lock().seen.contains_key(id))
    }

    async fn seen_count(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.lock().seen.len() as u64)
    }

    async fn commit_seen(&self, ids: &[String], now: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.lock();
        for id in ids {
            if let Some(row) = inner.seen.get_mut(id) {
                row.committed_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    async fn reconcile_reserved(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let mut leftover: Vec<(DateTime<Utc>, String)> = Vec::new();
        for (id, row) in inner.seen.iter_mut() {
            if row.committed_at.is_none() {
                row.committed_at = Some(now);
                leftover.push((row.first_seen, id.clone()));
            }
        }
        leftover.sort();
        Ok(leftover.into_iter().map(|(_, id)| id).collect())
    }

    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let before = inner.seen.len();
        inner
            .seen
            .retain(|_, row| row.committed_at.is_none() || row.first_seen >= cutoff);
        Ok((before - inner.seen.len()) as u64)
    }

    async fn upsert_subscriber(
        &self,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let sub = inner.subscribers.entry(chat_id).or_insert(Subscriber {
            chat_id,
            status: SubscriberStatus::Active,
            created_at: now,
            updated_at: now,
        });
        sub.status = SubscriberStatus::Active;
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn remove_subscriber(&self, chat_id: ChatId) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.lock().subscribers.remove(&chat_id).is_some())
    }

    async fn set_subscriber_status(
        &self,
        chat_id: ChatId,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        if let Some(sub) = self.lock().subscribers.get_mut(&chat_id) {
            sub.status = status;
            sub.updated_at = now;
        }
        Ok(())
    }

    async fn subscriber(&self, chat_id: ChatId) -> Result<Option<Subscriber>, StoreError> {
        self.check()?;
        Ok(self.lock().subscribers.get(&chat_id).cloned())
    }

    async fn subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        self.check()?;
        Ok(self.lock().subscribers.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
