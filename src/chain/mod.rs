//! Blockchain data source abstraction
//!
//! Providers are swappable behind [`ChainSource`]; each normalizes its wire
//! format into [`ChainTransaction`] so the confirmation engine never sees
//! provider specifics.

pub mod esplora;

use async_trait::async_trait;
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::PaymentError;

pub use esplora::EsploraClient;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// Throttled by the provider; `reset_at` is its resume time when given
    #[error("rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

impl From<ChainError> for PaymentError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::RateLimited { reset_at } => PaymentError::RateLimited { reset_at },
            ChainError::Unavailable(msg) => PaymentError::Unavailable(msg),
        }
    }
}

/// Provider-neutral transaction shape
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub txid: String,
    /// None while unconfirmed
    pub block_height: Option<u64>,
    pub block_time: Option<DateTime<Utc>>,
    pub outputs: Vec<ChainTxOut>,
    pub inputs: Vec<ChainTxIn>,
}

#[derive(Debug, Clone)]
pub struct ChainTxOut {
    pub value: Amount,
    /// None for outputs without a standard address form (op_return etc.)
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChainTxIn {
    pub value: Amount,
    pub address: Option<String>,
}

impl ChainTransaction {
    /// Whether any output pays the given address
    pub fn pays(&self, raw_address: &str) -> bool {
        self.outputs
            .iter()
            .any(|out| out.address.as_deref() == Some(raw_address))
    }
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Every transaction that ever paid the address, confirmed or not
    async fn transactions_received(
        &self,
        address: &str,
    ) -> Result<Vec<ChainTransaction>, ChainError>;

    /// Current tip height of the chain
    async fn tip_height(&self) -> Result<u64, ChainError>;
}
