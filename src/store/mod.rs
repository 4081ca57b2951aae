//! Repository contract for wallets, addresses and transactions
//!
//! Any relational or document store satisfies this trait; the crate ships a
//! reference in-memory implementation used by the test suite and by
//! single-process deployments.

pub mod memory;
pub mod models;

use async_trait::async_trait;
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::StoreError;
use models::{
    AddressId, AddressRecord, AddressStatus, TxRecord, TxRecordId, Wallet, WalletId, WalletStatus,
};

pub use memory::MemoryStore;
pub use models::TxOutputRecord;

/// Insert shape for a transaction not yet known to the store
#[derive(Debug, Clone)]
pub struct NewTx {
    pub txid: String,
    pub block_height: Option<u64>,
    pub block_time: Option<DateTime<Utc>>,
    pub outputs: Vec<TxOutputRecord>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- wallets ---

    /// Idempotent: the same master public key always resolves to one wallet
    async fn get_or_create_wallet(&self, master_public_key: &str) -> Result<Wallet, StoreError>;

    async fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    async fn active_wallets(&self) -> Result<Vec<Wallet>, StoreError>;

    async fn set_wallet_status(&self, id: WalletId, status: WalletStatus)
        -> Result<(), StoreError>;

    async fn set_highest_derived_index(&self, id: WalletId, index: u32) -> Result<(), StoreError>;

    // --- addresses ---

    /// Lookup keyed on the raw address string itself, never the index; a
    /// lost cursor can re-derive an address another wallet already owns.
    async fn find_address_by_raw(
        &self,
        raw_address: &str,
    ) -> Result<Option<AddressRecord>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if the raw address or the
    /// (wallet, index) slot is taken. A hard uniqueness constraint: nothing
    /// is written on failure.
    async fn create_address(
        &self,
        wallet_id: WalletId,
        derivation_index: u32,
        raw_address: &str,
    ) -> Result<AddressRecord, StoreError>;

    async fn address(&self, id: AddressId) -> Result<Option<AddressRecord>, StoreError>;

    async fn set_address_status(
        &self,
        id: AddressId,
        status: AddressStatus,
    ) -> Result<(), StoreError>;

    /// Move an orphaned address under a new parent wallet
    async fn reparent_address(&self, id: AddressId, wallet_id: WalletId)
        -> Result<(), StoreError>;

    /// Atomically claim one verified-unused address: compare-and-swap
    /// Unused -> Assigned and stamp the target amount and order reference in
    /// the same step. Two concurrent callers can never receive the same
    /// record. Scans the given wallet, or all active wallets in creation
    /// order when none is given.
    async fn claim_unused(
        &self,
        wallet_id: Option<WalletId>,
        target_amount: Amount,
        order_ref: &str,
    ) -> Result<Option<AddressRecord>, StoreError>;

    /// Status-filtered query, ordered least-recently-checked first
    async fn addresses_with_status(
        &self,
        wallet_id: Option<WalletId>,
        status: AddressStatus,
        limit: Option<usize>,
    ) -> Result<Vec<AddressRecord>, StoreError>;

    /// Persist the outcome of a chain check: the refreshed known-txid map
    /// and the checked-at stamp
    async fn record_check(
        &self,
        id: AddressId,
        known_txids: BTreeMap<String, TxRecordId>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- transactions ---

    async fn find_tx_by_txid(&self, txid: &str) -> Result<Option<TxRecord>, StoreError>;

    async fn insert_tx(&self, tx: NewTx) -> Result<TxRecord, StoreError>;

    /// A mempool transaction confirming on a later poll gains its block fields
    async fn update_tx_confirmation(
        &self,
        id: TxRecordId,
        block_height: Option<u64>,
        block_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Append-only back-reference; one transaction can pay several
    /// addresses of the same wallet
    async fn link_tx_to_address(&self, id: TxRecordId, address: AddressId)
        -> Result<(), StoreError>;

    async fn txs_for_address(&self, address: AddressId) -> Result<Vec<TxRecord>, StoreError>;
}
