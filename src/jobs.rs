//! Background job coordination
//!
//! A small per-kind state machine over an abstract durable-delay primitive
//! (delayed queue, cron, timer wheel: anything satisfying [`Scheduler`]).
//! At most one instance of a job kind is ever pending. A job leaves the
//! pending set before it executes, so a running job arranging its own next
//! run never trips the dedup check against itself, and when a successor is
//! already waiting the reschedule is skipped rather than duplicated.
//!
//! This is the only component that catches a rate-limit failure, and only
//! to compute a future run time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::engine::ConfirmationEngine;
use crate::error::PaymentError;
use crate::pool::AddressPool;
use crate::store::models::{AddressId, AddressStatus, WalletId};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Recurring top-up across all active wallets
    PoolTopUp,
    /// One-off top-up of a single wallet (created, or an address consumed)
    WalletTopUp,
    /// Re-check every assigned address for payment
    CheckAssigned,
    /// Classify newly derived addresses as unused or used
    CheckFresh,
}

impl JobKind {
    fn slug(&self) -> &'static str {
        match self {
            JobKind::PoolTopUp => "pool-top-up",
            JobKind::WalletTopUp => "wallet-top-up",
            JobKind::CheckAssigned => "check-assigned",
            JobKind::CheckFresh => "check-fresh",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub kind: JobKind,
    pub wallet_id: Option<WalletId>,
    pub address_ids: Vec<AddressId>,
}

impl Job {
    pub fn pool_top_up() -> Self {
        Self {
            kind: JobKind::PoolTopUp,
            wallet_id: None,
            address_ids: Vec::new(),
        }
    }

    pub fn wallet_top_up(wallet_id: WalletId) -> Self {
        Self {
            kind: JobKind::WalletTopUp,
            wallet_id: Some(wallet_id),
            address_ids: Vec::new(),
        }
    }

    pub fn check_assigned() -> Self {
        Self {
            kind: JobKind::CheckAssigned,
            wallet_id: None,
            address_ids: Vec::new(),
        }
    }

    pub fn check_fresh(address_ids: Vec<AddressId>) -> Self {
        Self {
            kind: JobKind::CheckFresh,
            wallet_id: None,
            address_ids,
        }
    }

    /// Key the pending-instance invariant is enforced on. Wallet top-ups
    /// dedup per wallet, everything else per kind.
    pub fn dedup_key(&self) -> String {
        match (self.kind, self.wallet_id) {
            (JobKind::WalletTopUp, Some(wallet_id)) => {
                format!("{}:{}", self.kind.slug(), wallet_id)
            }
            _ => self.kind.slug().to_string(),
        }
    }
}

/// Durable-delay primitive the coordinator schedules against.
///
/// The embedder must remove a job from the pending set before executing it
/// (as [`MemoryScheduler::take_due`] does): `has_pending` covers only jobs
/// waiting to run, never the one currently being executed, so a running job
/// can always schedule its own successor.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Whether an instance with this dedup key is already waiting to run
    async fn has_pending(&self, dedup_key: &str) -> bool;

    async fn schedule(&self, job: Job, run_at: DateTime<Utc>);

    async fn schedule_recurring(&self, job: Job, every: Duration);
}

/// In-memory scheduler: jobs queue up and are drained by the embedder.
/// Serves the test suite and single-process deployments where a tokio
/// interval loop plays the durable queue.
pub struct MemoryScheduler {
    pending: Mutex<Vec<ScheduledJob>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job: Job,
    pub run_at: DateTime<Utc>,
    pub recurring: Option<Duration>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything scheduled, soonest first
    pub async fn pending(&self) -> Vec<ScheduledJob> {
        let mut jobs = self.pending.lock().await.clone();
        jobs.sort_by_key(|j| j.run_at);
        jobs
    }

    /// Remove and return the one-off jobs due at `now`; recurring entries
    /// stay registered with their run time advanced by the interval
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut pending = self.pending.lock().await;
        let mut due = Vec::new();
        pending.retain_mut(|entry| {
            if entry.run_at > now {
                return true;
            }
            due.push(entry.job.clone());
            match entry.recurring {
                Some(every) => {
                    entry.run_at = now
                        + chrono::Duration::from_std(every)
                            .unwrap_or_else(|_| chrono::Duration::seconds(600));
                    true
                }
                None => false,
            }
        });
        due
    }
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn has_pending(&self, dedup_key: &str) -> bool {
        self.pending
            .lock()
            .await
            .iter()
            .any(|entry| entry.job.dedup_key() == dedup_key)
    }

    async fn schedule(&self, job: Job, run_at: DateTime<Utc>) {
        self.pending.lock().await.push(ScheduledJob {
            job,
            run_at,
            recurring: None,
        });
    }

    async fn schedule_recurring(&self, job: Job, every: Duration) {
        let run_at = Utc::now()
            + chrono::Duration::from_std(every).unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.pending.lock().await.push(ScheduledJob {
            job,
            run_at,
            recurring: Some(every),
        });
    }
}

pub struct JobCoordinator {
    store: Arc<dyn Store>,
    pool: Arc<AddressPool>,
    engine: Arc<ConfirmationEngine>,
    scheduler: Arc<dyn Scheduler>,
    pool_target: usize,
    check_interval: Duration,
    retry_delay: Duration,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<AddressPool>,
        engine: Arc<ConfirmationEngine>,
        scheduler: Arc<dyn Scheduler>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            pool,
            engine,
            scheduler,
            pool_target: config.pool_target,
            check_interval: config.check_interval,
            retry_delay: config.retry_delay,
        }
    }

    /// Register the recurring maintenance cadence. Only the pool top-up is
    /// interval-driven; assigned-address checks pace themselves and go
    /// quiet when nothing is assigned, re-triggered by the next assignment.
    pub async fn install_recurring(&self, top_up_every: Duration) {
        self.scheduler
            .schedule_recurring(Job::pool_top_up(), top_up_every)
            .await;
        log::info!("recurring pool top-up installed (every {:?})", top_up_every);
    }

    /// Schedule a job unless an instance is already pending under the same
    /// dedup key: at most one stays queued, whether the duplicate comes
    /// from an outside trigger or from a running job whose successor is
    /// already waiting. Returns whether the job was scheduled.
    pub async fn enqueue(&self, job: Job, run_at: DateTime<Utc>) -> bool {
        if self.scheduler.has_pending(&job.dedup_key()).await {
            log::debug!("skipping {}: already pending", job.dedup_key());
            return false;
        }
        self.scheduler.schedule(job, run_at).await;
        true
    }

    /// Execute one job to completion and apply its reschedule policy
    pub async fn run(&self, job: Job) {
        let result = match job.kind {
            JobKind::PoolTopUp => self.run_pool_top_up().await,
            JobKind::WalletTopUp => self.run_wallet_top_up(&job).await,
            JobKind::CheckAssigned => self.run_check_assigned().await,
            JobKind::CheckFresh => self.run_check_fresh(&job).await,
        };

        if let Err(err) = result {
            self.handle_failure(&job, err).await;
        }
    }

    async fn handle_failure(&self, job: &Job, err: PaymentError) {
        match err {
            PaymentError::RateLimited { reset_at } => {
                // Recurring top-up relies on its interval; everything else
                // comes back at the provider's reset time, or after the
                // fixed fallback when none was given
                if job.kind == JobKind::PoolTopUp {
                    log::warn!("pool top-up rate limited; next interval will retry");
                    return;
                }
                let run_at = reset_at.unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(900))
                });
                log::warn!(
                    "{} rate limited, rescheduled for {}",
                    job.dedup_key(),
                    run_at
                );
                self.enqueue(job.clone(), run_at).await;
            }
            PaymentError::Unavailable(msg) => {
                if job.kind == JobKind::PoolTopUp {
                    log::warn!("pool top-up failed ({}); next interval will retry", msg);
                    return;
                }
                let run_at = Utc::now()
                    + chrono::Duration::from_std(self.retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(900));
                log::warn!(
                    "{} failed ({}), rescheduled for {}",
                    job.dedup_key(),
                    msg,
                    run_at
                );
                self.enqueue(job.clone(), run_at).await;
            }
            other => {
                // Hard errors are not retried; they indicate a bug or a
                // data-integrity breach and need an operator
                log::error!("{} failed hard: {}", job.dedup_key(), other);
            }
        }
    }

    async fn run_pool_top_up(&self) -> Result<(), PaymentError> {
        let wallets = self.store.active_wallets().await?;
        if wallets.is_empty() {
            log::debug!("pool top-up: no active wallets");
            return Ok(());
        }
        let reports = self.pool.ensure_unused(&wallets, self.pool_target).await?;
        for report in &reports {
            log::info!(
                "wallet {}: {} unused ({} minted, {} found used{})",
                report.wallet_id,
                report.confirmed_unused_after,
                report.newly_minted.len(),
                report.unexpectedly_used.len(),
                if report.exhausted { ", cap hit" } else { "" }
            );
        }
        Ok(())
    }

    async fn run_wallet_top_up(&self, job: &Job) -> Result<(), PaymentError> {
        let Some(wallet_id) = job.wallet_id else {
            log::error!("wallet top-up without a wallet id");
            return Ok(());
        };
        let Some(wallet) = self.store.wallet(wallet_id).await? else {
            log::warn!("wallet top-up: {} no longer exists", wallet_id);
            return Ok(());
        };

        let unused = self
            .store
            .addresses_with_status(Some(wallet.id), AddressStatus::Unused, None)
            .await?;
        let missing = self.pool_target.saturating_sub(unused.len());
        if missing == 0 {
            return Ok(());
        }

        let batch = self.pool.generate_addresses(&wallet, missing).await?;
        let fresh_ids: Vec<AddressId> = batch.created.iter().map(|a| a.id).collect();
        if !fresh_ids.is_empty() {
            self.enqueue(Job::check_fresh(fresh_ids), Utc::now()).await;
        }
        Ok(())
    }

    async fn run_check_assigned(&self) -> Result<(), PaymentError> {
        let assigned = self
            .store
            .addresses_with_status(None, AddressStatus::Assigned, None)
            .await?;
        if assigned.is_empty() {
            // Terminal: the next assignment schedules a fresh instance
            log::debug!("no assigned addresses, check loop going quiet");
            return Ok(());
        }

        for address in &assigned {
            // A throttle here aborts the rest of the batch; progress on the
            // earlier addresses is already persisted
            let check = self.engine.check_for_payment(address).await?;
            if check.is_paid() {
                self.store
                    .set_address_status(address.id, AddressStatus::Used)
                    .await?;
                log::info!(
                    "address {} paid: {} confirmed against target {}",
                    address.raw_address,
                    check.confirmed_received,
                    check.target_amount
                );
                if let Some(order_ref) = &address.order_ref {
                    log::info!("order {} settled", order_ref);
                }
            }
        }

        let run_at = Utc::now()
            + chrono::Duration::from_std(self.check_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.enqueue(Job::check_assigned(), run_at).await;
        Ok(())
    }

    async fn run_check_fresh(&self, job: &Job) -> Result<(), PaymentError> {
        for id in &job.address_ids {
            let Some(address) = self.store.address(*id).await? else {
                continue;
            };
            if address.status != AddressStatus::Unknown {
                continue;
            }
            let outcome = self.engine.refresh_transactions(&address).await?;
            let status = if outcome.all_known.is_empty() {
                AddressStatus::Unused
            } else {
                AddressStatus::Used
            };
            self.store.set_address_status(address.id, status).await?;
        }
        Ok(())
    }
}
