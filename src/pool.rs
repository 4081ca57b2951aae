//! Address pool management
//!
//! Keeps every wallet's stock of verified-unused addresses at its target
//! without handing an address out twice and without trusting local state
//! alone: an address the store believes unused may have been paid outside
//! this system's visibility, so candidates are re-verified against the
//! chain before they count.

use std::sync::Arc;

use crate::derivation::AddressDeriver;
use crate::engine::ConfirmationEngine;
use crate::error::{PaymentError, StoreError};
use crate::store::models::{AddressId, AddressRecord, AddressStatus, Wallet, WalletId};
use crate::store::Store;

/// Result of one `generate_addresses` run
#[derive(Debug, Clone, Default)]
pub struct GeneratedBatch {
    /// Freshly persisted addresses, status Unknown
    pub created: Vec<AddressRecord>,
    /// Previously derived addresses found under another wallet and
    /// re-parented here; they do not count toward the requested quota
    pub orphans_adopted: Vec<AddressRecord>,
}

/// Per-wallet outcome of one `ensure_unused` convergence run
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub wallet_id: WalletId,
    /// Addresses the store held as unused before re-verification
    pub assumed_unused_before: usize,
    /// Verified-unused count after the run
    pub confirmed_unused_after: usize,
    /// Addresses found spent outside this system's visibility
    pub unexpectedly_used: Vec<AddressId>,
    /// Addresses minted and verified clean during this run
    pub newly_minted: Vec<AddressRecord>,
    /// The per-run derivation cap was hit before reaching the target;
    /// a later run resumes from the persisted cursor
    pub exhausted: bool,
}

pub struct AddressPool {
    store: Arc<dyn Store>,
    engine: Arc<ConfirmationEngine>,
    deriver: AddressDeriver,
    max_derivations_per_run: u32,
}

impl AddressPool {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<ConfirmationEngine>,
        deriver: AddressDeriver,
        max_derivations_per_run: u32,
    ) -> Self {
        Self {
            store,
            engine,
            deriver,
            max_derivations_per_run,
        }
    }

    /// Derive and persist `count` new addresses for the wallet, walking the
    /// cursor past anything already recorded.
    ///
    /// Candidates are looked up by their raw address string, never by
    /// index: a lost cursor re-derives addresses that may already exist,
    /// possibly under another wallet (an orphan, which is adopted). Either
    /// way the slot is skipped without counting toward `count`. The cursor
    /// is persisted even when the walk stops early on an error.
    pub async fn generate_addresses(
        &self,
        wallet: &Wallet,
        count: usize,
    ) -> Result<GeneratedBatch, PaymentError> {
        let mut cursor = wallet.highest_derived_index;
        let mut batch = GeneratedBatch::default();

        let walk = self
            .walk_derivations(wallet, count, &mut cursor, &mut batch)
            .await;

        if cursor != wallet.highest_derived_index {
            if let Some(index) = cursor {
                self.store.set_highest_derived_index(wallet.id, index).await?;
            }
        }

        walk?;

        log::debug!(
            "wallet {}: {} address(es) created, {} orphan(s) adopted, cursor at {:?}",
            wallet.id,
            batch.created.len(),
            batch.orphans_adopted.len(),
            cursor
        );
        Ok(batch)
    }

    async fn walk_derivations(
        &self,
        wallet: &Wallet,
        count: usize,
        cursor: &mut Option<u32>,
        batch: &mut GeneratedBatch,
    ) -> Result<(), PaymentError> {
        while batch.created.len() < count {
            let index = match *cursor {
                None => 0,
                Some(i) => i.checked_add(1).ok_or_else(|| {
                    PaymentError::InvalidKey("derivation index space exhausted".to_string())
                })?,
            };

            let derived = self.deriver.derive(&wallet.master_public_key, index)?;
            let raw = derived.to_string();

            match self.store.find_address_by_raw(&raw).await? {
                Some(existing) if existing.wallet_id != wallet.id => {
                    log::warn!(
                        "address {} at index {} belongs to wallet {}, re-parenting to {}",
                        raw,
                        index,
                        existing.wallet_id,
                        wallet.id
                    );
                    self.store.reparent_address(existing.id, wallet.id).await?;
                    *cursor = Some(index);
                    if let Some(adopted) = self.store.address(existing.id).await? {
                        batch.orphans_adopted.push(adopted);
                    }
                }
                Some(_) => {
                    // Already ours: a re-run over previously derived ground
                    *cursor = Some(index);
                }
                None => {
                    let record = match self.store.create_address(wallet.id, index, &raw).await {
                        Ok(record) => record,
                        Err(StoreError::AlreadyExists(what)) => {
                            return Err(PaymentError::AlreadyExists(what));
                        }
                        Err(err) => return Err(err.into()),
                    };
                    *cursor = Some(index);
                    batch.created.push(record);
                }
            }
        }
        Ok(())
    }

    /// Converge each wallet toward `required_count` verified-unused
    /// addresses.
    ///
    /// Locally-unused addresses are re-verified first, least-recently
    /// checked leading; any with discovered activity flip to Used and do
    /// not count. While a wallet is short, new addresses are minted one at
    /// a time and verified immediately. Work per run is bounded by the
    /// derivation cap; a capped wallet is reported `exhausted` and resumes
    /// from its cursor on the next run.
    ///
    /// A rate-limit failure propagates out unchanged; scheduling a retry
    /// is the job coordinator's concern, not this loop's.
    pub async fn ensure_unused(
        &self,
        wallets: &[Wallet],
        required_count: usize,
    ) -> Result<Vec<PoolReport>, PaymentError> {
        let mut reports = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            reports.push(self.converge_wallet(wallet, required_count).await?);
        }
        Ok(reports)
    }

    async fn converge_wallet(
        &self,
        wallet: &Wallet,
        required_count: usize,
    ) -> Result<PoolReport, PaymentError> {
        let assumed = self
            .store
            .addresses_with_status(Some(wallet.id), AddressStatus::Unused, Some(required_count))
            .await?;

        let mut report = PoolReport {
            wallet_id: wallet.id,
            assumed_unused_before: assumed.len(),
            confirmed_unused_after: 0,
            unexpectedly_used: Vec::new(),
            newly_minted: Vec::new(),
            exhausted: false,
        };

        let mut verified = 0usize;
        for address in &assumed {
            if self.verify_clean(address).await? {
                verified += 1;
            } else {
                report.unexpectedly_used.push(address.id);
            }
        }

        let mut derived_this_run = 0u32;
        while verified < required_count {
            if derived_this_run >= self.max_derivations_per_run {
                log::warn!(
                    "wallet {}: derivation cap {} hit with {}/{} unused; resuming next run",
                    wallet.id,
                    self.max_derivations_per_run,
                    verified,
                    required_count
                );
                report.exhausted = true;
                break;
            }

            // Re-read the wallet: the cursor moved if this loop already minted
            let current = self
                .store
                .wallet(wallet.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("wallet {}", wallet.id)))?;

            let batch = self.generate_addresses(&current, 1).await?;
            derived_this_run +=
                (batch.created.len() + batch.orphans_adopted.len()).max(1) as u32;

            for address in batch.created {
                if self.verify_clean(&address).await? {
                    verified += 1;
                    if let Some(fresh) = self.store.address(address.id).await? {
                        report.newly_minted.push(fresh);
                    }
                } else {
                    report.unexpectedly_used.push(address.id);
                }
            }
        }

        report.confirmed_unused_after = verified;
        Ok(report)
    }

    /// Check one address against the chain; flips it to Used on any
    /// discovered activity, to Unused when clean. Returns whether it is
    /// clean and spendable for a fresh order.
    async fn verify_clean(&self, address: &AddressRecord) -> Result<bool, PaymentError> {
        let outcome = self.engine.refresh_transactions(address).await?;
        if outcome.all_known.is_empty() {
            if address.status != AddressStatus::Unused {
                self.store
                    .set_address_status(address.id, AddressStatus::Unused)
                    .await?;
            }
            Ok(true)
        } else {
            log::info!(
                "address {} has prior activity ({} tx), marking used",
                address.raw_address,
                outcome.all_known.len()
            );
            self.store
                .set_address_status(address.id, AddressStatus::Used)
                .await?;
            Ok(false)
        }
    }
}
