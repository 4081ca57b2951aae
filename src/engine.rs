//! Confirmation engine
//!
//! Turns raw adapter data into persisted transaction records and a
//! confirmed-received amount per address. Rate-limit failures propagate
//! unchanged to the job coordinator; progress persisted before a failure is
//! never rolled back.

use bitcoin::Amount;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::chain::ChainSource;
use crate::config::GatewayConfig;
use crate::error::{PaymentError, StoreError};
use crate::store::models::{AddressRecord, TxRecordId};
use crate::store::{NewTx, Store, TxOutputRecord};

/// Cached chain tip, shared across every address checked in one window.
///
/// Last-write-wins is sufficient: a stale read costs one redundant remote
/// call, never a wrong confirmation count.
struct HeightCache {
    inner: Mutex<Option<(u64, Instant)>>,
    ttl: Duration,
}

impl HeightCache {
    fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(None),
            ttl,
        }
    }

    fn get(&self) -> Option<u64> {
        let guard = self.inner.lock().ok()?;
        guard
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(height, _)| *height)
    }

    fn put(&self, height: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some((height, Instant::now()));
        }
    }
}

/// Outcome of one adapter refresh for one address
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Txids added to the address's known map by this refresh
    pub new_txids: Vec<String>,
    /// The full known map after the refresh
    pub all_known: BTreeMap<String, TxRecordId>,
}

#[derive(Debug, Clone)]
pub struct PaymentCheck {
    pub confirmed_received: Amount,
    pub new_txids: Vec<String>,
    pub target_amount: Amount,
}

impl PaymentCheck {
    pub fn is_paid(&self) -> bool {
        self.confirmed_received >= self.target_amount
    }
}

pub struct ConfirmationEngine {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainSource>,
    required_confirmations: u64,
    height_cache: HeightCache,
}

impl ConfirmationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainSource>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            chain,
            required_confirmations: config.required_confirmations,
            height_cache: HeightCache::new(config.height_cache_ttl),
        }
    }

    pub fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }

    /// Query the adapter for everything received at the address and persist
    /// what is new: unseen transactions are inserted, known-but-unconfirmed
    /// ones gain their block fields, and the address back-reference is added
    /// where missing. The address's known-txid map and checked-at stamp are
    /// updated last.
    pub async fn refresh_transactions(
        &self,
        address: &AddressRecord,
    ) -> Result<RefreshOutcome, PaymentError> {
        let chain_txs = self.chain.transactions_received(&address.raw_address).await?;

        let mut known = address.known_txids.clone();
        let mut new_txids = Vec::new();

        for chain_tx in chain_txs {
            let record_id = match self.store.find_tx_by_txid(&chain_tx.txid).await? {
                Some(existing) => {
                    if existing.block_height.is_none() && chain_tx.block_height.is_some() {
                        self.store
                            .update_tx_confirmation(
                                existing.id,
                                chain_tx.block_height,
                                chain_tx.block_time,
                            )
                            .await?;
                    }
                    if !existing.linked_addresses.contains(&address.id) {
                        self.store.link_tx_to_address(existing.id, address.id).await?;
                    }
                    existing.id
                }
                None => {
                    let outputs = chain_tx
                        .outputs
                        .iter()
                        .filter_map(|out| {
                            out.address.as_ref().map(|addr| TxOutputRecord {
                                value: out.value,
                                to_address: addr.clone(),
                            })
                        })
                        .collect();
                    let insert = self
                        .store
                        .insert_tx(NewTx {
                            txid: chain_tx.txid.clone(),
                            block_height: chain_tx.block_height,
                            block_time: chain_tx.block_time,
                            outputs,
                        })
                        .await;
                    let record_id = match insert {
                        Ok(record) => record.id,
                        // A concurrent worker persisted this txid between
                        // our lookup and insert; matching by txid stays
                        // idempotent, so adopt the winner's record
                        Err(StoreError::AlreadyExists(_)) => {
                            self.store
                                .find_tx_by_txid(&chain_tx.txid)
                                .await?
                                .ok_or_else(|| {
                                    StoreError::NotFound(format!(
                                        "transaction {}",
                                        chain_tx.txid
                                    ))
                                })?
                                .id
                        }
                        Err(err) => return Err(err.into()),
                    };
                    self.store.link_tx_to_address(record_id, address.id).await?;
                    record_id
                }
            };

            if known.insert(chain_tx.txid.clone(), record_id).is_none() {
                new_txids.push(chain_tx.txid);
            }
        }

        if !new_txids.is_empty() {
            log::info!(
                "{}: {} new transaction(s) discovered",
                address.raw_address,
                new_txids.len()
            );
        }

        self.store
            .record_check(address.id, known.clone(), Utc::now())
            .await?;

        Ok(RefreshOutcome {
            new_txids,
            all_known: known,
        })
    }

    /// Chain tip, served from the cache while fresh
    pub async fn current_height(&self) -> Result<u64, PaymentError> {
        if let Some(height) = self.height_cache.get() {
            return Ok(height);
        }
        let height = self.chain.tip_height().await?;
        self.height_cache.put(height);
        log::debug!("chain tip refreshed: {}", height);
        Ok(height)
    }

    /// Sum of outputs paying exactly this address across its linked
    /// transactions, counting only those with at least
    /// `required_confirmations` blocks on top. Unconfirmed transactions
    /// never count, whatever the requirement.
    pub async fn confirmed_balance(
        &self,
        address: &AddressRecord,
        required_confirmations: u64,
    ) -> Result<Amount, PaymentError> {
        let current_height = self.current_height().await?;
        let txs = self.store.txs_for_address(address.id).await?;

        let mut total = Amount::ZERO;
        for tx in txs {
            let Some(height) = tx.block_height else {
                continue;
            };
            if current_height.saturating_sub(height) < required_confirmations {
                continue;
            }
            total += tx.received_by(&address.raw_address);
        }
        Ok(total)
    }

    /// Refresh then evaluate: the full payment determination for one
    /// assigned address. Requires a target amount to have been stamped
    /// first; checking an address without one is an ordering bug.
    pub async fn check_for_payment(
        &self,
        address: &AddressRecord,
    ) -> Result<PaymentCheck, PaymentError> {
        let target_amount = address
            .target_amount
            .ok_or_else(|| PaymentError::NoTargetAmount(address.raw_address.clone()))?;

        let refresh = self.refresh_transactions(address).await?;
        let confirmed_received = self
            .confirmed_balance(address, self.required_confirmations)
            .await?;

        Ok(PaymentCheck {
            confirmed_received,
            new_txids: refresh.new_txids,
            target_amount,
        })
    }
}
