use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("rate limited by data source (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("data source unavailable: {0}")]
    Unavailable(String),

    #[error("address already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid master public key: {0}")]
    InvalidKey(String),

    #[error("no target amount set for address: {0}")]
    NoTargetAmount(String),

    #[error("no unused address available")]
    NoAddressAvailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PaymentError {
    /// True for failures that resolve on their own given a later retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PaymentError::RateLimited { .. } | PaymentError::Unavailable(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}
