//! Deduplication filter.
//!
//! Classifies normalized deals as new or already seen against the store's
//! seen-set. A deal is reserved (written to the seen-set) in the same atomic
//! store call that decides it is new, before any dispatch starts. A crash in
//! the middle of dispatch therefore never leads to re-delivery after restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ingest::types::Deal;
use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub deal: Deal,
    pub is_new: bool,
}

/// The store failed partway. `reserved` holds the deals this call already
/// reserved; they must still be dispatched or they are lost for good.
#[derive(Debug, Error)]
#[error("dedup aborted after {} reservation(s): {source}", .reserved.len())]
pub struct DedupAborted {
    pub reserved: Vec<Deal>,
    #[source]
    pub source: StoreError,
}

/// Puts deals into oldest-first order.
///
/// Feeds list newest first, so the feed order is reversed. When every deal
/// carries a publish date the result is additionally sorted by it (stable, so
/// ties keep feed order).
pub fn oldest_first(mut deals: Vec<Deal>) -> Vec<Deal> {
    deals.reverse();
    if deals.iter().all(|d| d.published_at.is_some()) {
        deals.sort_by_key(|d| d.published_at);
    }
    deals
}

pub struct DedupFilter {
    store: Arc<dyn StateStore>,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Classifies `deals` (in feed order) and reserves every new id.
    /// Output is oldest-first. A repeated id within one batch is new at most once.
    pub async fn filter(
        &self,
        deals: Vec<Deal>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Classified>, DedupAborted> {
        let ordered = oldest_first(deals);
        let mut out = Vec::with_capacity(ordered.len());

        for deal in ordered {
            match self.store.reserve_seen(&deal.id, now).await {
                Ok(is_new) => out.push(Classified { deal, is_new }),
                Err(source) => {
                    let reserved = out
                        .into_iter()
                        .filter(|c: &Classified| c.is_new)
                        .map(|c| c.deal)
                        .collect();
                    return Err(DedupAborted { reserved, source });
                }
            }
        }

        Ok(out)
    }
}

/// Just the new deals, order preserved.
pub fn new_deals(classified: Vec<Classified>) -> Vec<Deal> {
    classified
        .into_iter()
        .filter(|c| c.is_new)
        .map(|c| c.deal)
        .collect()
}
