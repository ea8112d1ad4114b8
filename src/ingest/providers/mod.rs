// src/ingest/providers/mod.rs
pub mod pepper_rss;

pub use pepper_rss::PepperRssProvider;
