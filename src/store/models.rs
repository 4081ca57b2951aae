//! Data models for payment records

use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type WalletId = Uuid;
pub type AddressId = Uuid;
pub type TxRecordId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Active,
    Inactive,
}

/// Address lifecycle. Transitions are monotonic
/// Unknown -> Unused -> Assigned -> Used, except that any unassigned state
/// jumps straight to Used when an out-of-band spend is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    /// Derived but never checked against the chain
    Unknown,
    /// Checked and clean
    Unused,
    /// Handed to an order, awaiting payment
    Assigned,
    /// Checked and found to have activity
    Used,
}

/// A watched extended public key. One wallet owns many addresses; only the
/// pool manager mutates the derivation cursor or the active flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub master_public_key: String,
    pub status: WalletStatus,
    /// Highest derivation index ever persisted, None before the first derive
    pub highest_derived_index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: AddressId,
    pub wallet_id: WalletId,
    pub derivation_index: u32,
    pub raw_address: String,
    pub status: AddressStatus,
    #[serde(default, with = "bitcoin::amount::serde::as_sat::opt")]
    pub target_amount: Option<Amount>,
    pub order_ref: Option<String>,
    /// txid -> stored transaction record, everything ever seen paying this address
    pub known_txids: BTreeMap<String, TxRecordId>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutputRecord {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub to_address: String,
}

/// A stored blockchain transaction. Immutable once confirmed, except for
/// `linked_addresses`, which only grows; one record per txid, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: TxRecordId,
    pub txid: String,
    /// None while the transaction sits in the mempool
    pub block_height: Option<u64>,
    pub block_time: Option<DateTime<Utc>>,
    pub outputs: Vec<TxOutputRecord>,
    pub linked_addresses: BTreeSet<AddressId>,
    pub first_seen_at: DateTime<Utc>,
}

impl TxRecord {
    /// Total value of the outputs paying exactly `raw_address`
    pub fn received_by(&self, raw_address: &str) -> Amount {
        self.outputs
            .iter()
            .filter(|out| out.to_address == raw_address)
            .map(|out| out.value)
            .sum()
    }
}
