//! Orchestration entry points
//!
//! [`PaymentGateway`] wires the store, chain adapter, confirmation engine,
//! pool manager and job coordinator together and exposes the operations an
//! embedding application calls: wallet registration, payment-address
//! requests and payment status.

use bitcoin::Amount;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainSource;
use crate::config::GatewayConfig;
use crate::derivation::AddressDeriver;
use crate::engine::ConfirmationEngine;
use crate::error::{PaymentError, StoreError};
use crate::jobs::{Job, JobCoordinator, Scheduler};
use crate::pool::AddressPool;
use crate::store::models::{AddressId, AddressRecord, AddressStatus, Wallet, WalletId, WalletStatus};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Not enough confirmed value yet
    Pending { received: Amount },
    /// Confirmed received value reached the target
    Paid { received: Amount },
}

pub struct PaymentGateway {
    store: Arc<dyn Store>,
    engine: Arc<ConfirmationEngine>,
    pool: Arc<AddressPool>,
    coordinator: Arc<JobCoordinator>,
    deriver: AddressDeriver,
    config: GatewayConfig,
}

impl PaymentGateway {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainSource>,
        scheduler: Arc<dyn Scheduler>,
        config: GatewayConfig,
    ) -> Self {
        let deriver = AddressDeriver::new(config.network);
        let engine = Arc::new(ConfirmationEngine::new(
            Arc::clone(&store),
            chain,
            &config,
        ));
        let pool = Arc::new(AddressPool::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            deriver.clone(),
            config.max_derivations_per_run,
        ));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&engine),
            scheduler,
            &config,
        ));
        Self {
            store,
            engine,
            pool,
            coordinator,
            deriver,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ConfirmationEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    /// Start watching an extended public key. Idempotent: registering the
    /// same key twice resolves to the same wallet. A one-off top-up job is
    /// queued so the new wallet gets its address stock.
    pub async fn register_wallet(&self, master_public_key: &str) -> Result<Wallet, PaymentError> {
        // Derivation doubles as format validation, before anything persists
        self.deriver.derive(master_public_key, 0)?;

        let wallet = self.store.get_or_create_wallet(master_public_key).await?;
        log::info!("watching wallet {} ({})", wallet.id, self.config.network);

        self.coordinator
            .enqueue(Job::wallet_top_up(wallet.id), Utc::now())
            .await;
        Ok(wallet)
    }

    /// Claim a verified-unused address for an order and stamp the expected
    /// amount on it. The claim is a single atomic status swap in the store,
    /// so concurrent orders always get distinct addresses.
    pub async fn request_payment_address(
        &self,
        target_amount: Amount,
        order_ref: &str,
    ) -> Result<AddressRecord, PaymentError> {
        let claimed = self
            .store
            .claim_unused(None, target_amount, order_ref)
            .await?
            .ok_or(PaymentError::NoAddressAvailable)?;

        log::info!(
            "address {} assigned to order {} (target {})",
            claimed.raw_address,
            order_ref,
            target_amount
        );

        // The pool just shrank, and the new assignment needs watching
        self.coordinator
            .enqueue(Job::wallet_top_up(claimed.wallet_id), Utc::now())
            .await;
        self.coordinator
            .enqueue(Job::check_assigned(), Utc::now())
            .await;

        Ok(claimed)
    }

    /// Current payment determination for an assigned address. Flips the
    /// address to Used once the confirmed amount reaches its target.
    pub async fn payment_status(&self, address_id: AddressId) -> Result<PaymentStatus, PaymentError> {
        let address = self
            .store
            .address(address_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("address {}", address_id)))?;

        let check = self.engine.check_for_payment(&address).await?;
        if check.is_paid() {
            if address.status != AddressStatus::Used {
                self.store
                    .set_address_status(address.id, AddressStatus::Used)
                    .await?;
            }
            Ok(PaymentStatus::Paid {
                received: check.confirmed_received,
            })
        } else {
            Ok(PaymentStatus::Pending {
                received: check.confirmed_received,
            })
        }
    }

    /// Register the recurring maintenance cadence with the scheduler
    pub async fn install_recurring_jobs(&self, top_up_every: Duration) {
        self.coordinator.install_recurring(top_up_every).await;
    }

    /// Stop maintaining a wallet's pool. Its assigned addresses keep being
    /// checked until their orders resolve.
    pub async fn retire_wallet(&self, wallet_id: WalletId) -> Result<(), PaymentError> {
        self.store
            .set_wallet_status(wallet_id, WalletStatus::Inactive)
            .await?;
        log::info!("wallet {} retired from pool maintenance", wallet_id);
        Ok(())
    }
}
