// src/config/mod.rs
pub mod app;

pub use app::{AppConfig, Redacted, CONFIG_ENV, DEFAULT_CONFIG_PATH};
