// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod api;
pub mod bootstrap;
pub mod clock;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod shutdown;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::ingest::scheduler::{CycleError, CycleReport, Pipeline, Scheduler};
pub use crate::ingest::types::{Deal, FeedSource, FetchError, RawEntry};
pub use crate::models::{ChatId, Subscriber, SubscriberStatus};
pub use crate::store::{StateStore, StoreError};
