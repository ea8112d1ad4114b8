//! Errors of the persistence layer.

use thiserror::Error;

/// Any failure to read or write persistent state. Fatal to the running cycle,
/// never to the process.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    OperationFailed(String),

    #[error("could not open store: {0}")]
    Open(String),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("store is closed")]
    Closed,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed => StoreError::Closed,
            other => StoreError::OperationFailed(other.to_string()),
        }
    }
}
