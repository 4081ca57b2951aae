//! Reference in-memory store
//!
//! Every trait method runs under one lock, so the uniqueness and
//! compare-and-swap guarantees hold without further coordination. Suitable
//! for tests and single-process deployments; durable stores implement the
//! same contract against their own transaction primitives.

use async_trait::async_trait;
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    AddressId, AddressRecord, AddressStatus, TxRecord, TxRecordId, Wallet, WalletId, WalletStatus,
};
use super::{NewTx, Store};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    /// Creation order matters: claims scan wallets oldest-first
    wallets: Vec<Wallet>,
    addresses: HashMap<AddressId, AddressRecord>,
    address_by_raw: HashMap<String, AddressId>,
    txs: HashMap<TxRecordId, TxRecord>,
    tx_by_txid: HashMap<String, TxRecordId>,
}

impl Inner {
    fn wallet_mut(&mut self, id: WalletId) -> Result<&mut Wallet, StoreError> {
        self.wallets
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet {}", id)))
    }

    fn address_mut(&mut self, id: AddressId) -> Result<&mut AddressRecord, StoreError> {
        self.addresses
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("address {}", id)))
    }

    fn unused_in_wallet(&self, wallet_id: WalletId) -> Option<AddressId> {
        let mut candidates: Vec<&AddressRecord> = self
            .addresses
            .values()
            .filter(|a| a.wallet_id == wallet_id && a.status == AddressStatus::Unused)
            .collect();
        candidates.sort_by_key(|a| (a.created_at, a.derivation_index));
        candidates.first().map(|a| a.id)
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_wallet(&self, master_public_key: &str) -> Result<Wallet, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .wallets
            .iter()
            .find(|w| w.master_public_key == master_public_key)
        {
            return Ok(existing.clone());
        }
        let wallet = Wallet {
            id: Uuid::new_v4(),
            master_public_key: master_public_key.to_string(),
            status: WalletStatus::Active,
            highest_derived_index: None,
            created_at: Utc::now(),
        };
        inner.wallets.push(wallet.clone());
        Ok(wallet)
    }

    async fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.wallets.iter().find(|w| w.id == id).cloned())
    }

    async fn active_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .wallets
            .iter()
            .filter(|w| w.status == WalletStatus::Active)
            .cloned()
            .collect())
    }

    async fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.wallet_mut(id)?.status = status;
        Ok(())
    }

    async fn set_highest_derived_index(&self, id: WalletId, index: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let wallet = inner.wallet_mut(id)?;
        // Cursor only ever moves forward
        if wallet.highest_derived_index.map_or(true, |i| index > i) {
            wallet.highest_derived_index = Some(index);
        }
        Ok(())
    }

    async fn find_address_by_raw(
        &self,
        raw_address: &str,
    ) -> Result<Option<AddressRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .address_by_raw
            .get(raw_address)
            .and_then(|id| inner.addresses.get(id))
            .cloned())
    }

    async fn create_address(
        &self,
        wallet_id: WalletId,
        derivation_index: u32,
        raw_address: &str,
    ) -> Result<AddressRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.address_by_raw.contains_key(raw_address) {
            return Err(StoreError::AlreadyExists(raw_address.to_string()));
        }
        if inner
            .addresses
            .values()
            .any(|a| a.wallet_id == wallet_id && a.derivation_index == derivation_index)
        {
            return Err(StoreError::AlreadyExists(format!(
                "index {} in wallet {}",
                derivation_index, wallet_id
            )));
        }
        let record = AddressRecord {
            id: Uuid::new_v4(),
            wallet_id,
            derivation_index,
            raw_address: raw_address.to_string(),
            status: AddressStatus::Unknown,
            target_amount: None,
            order_ref: None,
            known_txids: BTreeMap::new(),
            last_checked_at: None,
            created_at: Utc::now(),
        };
        inner
            .address_by_raw
            .insert(raw_address.to_string(), record.id);
        inner.addresses.insert(record.id, record.clone());
        Ok(record)
    }

    async fn address(&self, id: AddressId) -> Result<Option<AddressRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.addresses.get(&id).cloned())
    }

    async fn set_address_status(
        &self,
        id: AddressId,
        status: AddressStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.address_mut(id)?.status = status;
        Ok(())
    }

    async fn reparent_address(
        &self,
        id: AddressId,
        wallet_id: WalletId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.address_mut(id)?.wallet_id = wallet_id;
        Ok(())
    }

    async fn claim_unused(
        &self,
        wallet_id: Option<WalletId>,
        target_amount: Amount,
        order_ref: &str,
    ) -> Result<Option<AddressRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let candidate = match wallet_id {
            Some(id) => inner.unused_in_wallet(id),
            None => {
                let active: Vec<WalletId> = inner
                    .wallets
                    .iter()
                    .filter(|w| w.status == WalletStatus::Active)
                    .map(|w| w.id)
                    .collect();
                active.into_iter().find_map(|id| inner.unused_in_wallet(id))
            }
        };
        let Some(id) = candidate else {
            return Ok(None);
        };
        // Claim and stamp in one step, still under the lock
        let record = inner.address_mut(id)?;
        record.status = AddressStatus::Assigned;
        record.target_amount = Some(target_amount);
        record.order_ref = Some(order_ref.to_string());
        Ok(Some(record.clone()))
    }

    async fn addresses_with_status(
        &self,
        wallet_id: Option<WalletId>,
        status: AddressStatus,
        limit: Option<usize>,
    ) -> Result<Vec<AddressRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<AddressRecord> = inner
            .addresses
            .values()
            .filter(|a| a.status == status)
            .filter(|a| wallet_id.map_or(true, |w| a.wallet_id == w))
            .cloned()
            .collect();
        // Least-recently-checked first; never-checked records lead
        matches.sort_by_key(|a| (a.last_checked_at, a.created_at, a.derivation_index));
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn record_check(
        &self,
        id: AddressId,
        known_txids: BTreeMap<String, TxRecordId>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.address_mut(id)?;
        record.known_txids = known_txids;
        record.last_checked_at = Some(checked_at);
        Ok(())
    }

    async fn find_tx_by_txid(&self, txid: &str) -> Result<Option<TxRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tx_by_txid
            .get(txid)
            .and_then(|id| inner.txs.get(id))
            .cloned())
    }

    async fn insert_tx(&self, tx: NewTx) -> Result<TxRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tx_by_txid.contains_key(&tx.txid) {
            return Err(StoreError::AlreadyExists(tx.txid));
        }
        let record = TxRecord {
            id: Uuid::new_v4(),
            txid: tx.txid,
            block_height: tx.block_height,
            block_time: tx.block_time,
            outputs: tx.outputs,
            linked_addresses: Default::default(),
            first_seen_at: Utc::now(),
        };
        inner.tx_by_txid.insert(record.txid.clone(), record.id);
        inner.txs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_tx_confirmation(
        &self,
        id: TxRecordId,
        block_height: Option<u64>,
        block_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .txs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))?;
        record.block_height = block_height;
        record.block_time = block_time;
        Ok(())
    }

    async fn link_tx_to_address(
        &self,
        id: TxRecordId,
        address: AddressId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .txs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))?;
        record.linked_addresses.insert(address);
        Ok(())
    }

    async fn txs_for_address(&self, address: AddressId) -> Result<Vec<TxRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut txs: Vec<TxRecord> = inner
            .txs
            .values()
            .filter(|t| t.linked_addresses.contains(&address))
            .cloned()
            .collect();
        txs.sort_by_key(|t| (t.block_height, t.first_seen_at));
        Ok(txs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wallet_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.get_or_create_wallet("xpub-a").await.unwrap();
        let second = store.get_or_create_wallet("xpub-a").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.active_wallets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_raw_address_creates_no_record() {
        let store = MemoryStore::new();
        let w1 = store.get_or_create_wallet("xpub-a").await.unwrap();
        let w2 = store.get_or_create_wallet("xpub-b").await.unwrap();
        store.create_address(w1.id, 0, "bc1qdup").await.unwrap();

        let err = store.create_address(w2.id, 5, "bc1qdup").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let all = store
            .addresses_with_status(None, AddressStatus::Unknown, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].wallet_id, w1.id);
    }

    #[tokio::test]
    async fn test_duplicate_index_per_wallet_is_rejected() {
        let store = MemoryStore::new();
        let wallet = store.get_or_create_wallet("xpub-a").await.unwrap();
        store.create_address(wallet.id, 3, "bc1qone").await.unwrap();
        let err = store
            .create_address(wallet.id, 3, "bc1qtwo")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_an_address() {
        let store = Arc::new(MemoryStore::new());
        let wallet = store.get_or_create_wallet("xpub-a").await.unwrap();
        for i in 0..2 {
            let addr = store
                .create_address(wallet.id, i, &format!("bc1qclaim{}", i))
                .await
                .unwrap();
            store
                .set_address_status(addr.id, AddressStatus::Unused)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim_unused(None, Amount::from_sat(1_000), &format!("order-{}", n))
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(record) = handle.await.unwrap() {
                claimed.push(record.id);
            }
        }
        claimed.sort();
        claimed.dedup();
        // Two unused addresses, four claimants: exactly two distinct winners
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn test_status_query_orders_least_recently_checked_first() {
        let store = MemoryStore::new();
        let wallet = store.get_or_create_wallet("xpub-a").await.unwrap();
        let a = store.create_address(wallet.id, 0, "bc1qa").await.unwrap();
        let b = store.create_address(wallet.id, 1, "bc1qb").await.unwrap();
        for id in [a.id, b.id] {
            store
                .set_address_status(id, AddressStatus::Unused)
                .await
                .unwrap();
        }
        // a was checked recently, b never
        store
            .record_check(a.id, BTreeMap::new(), Utc::now())
            .await
            .unwrap();

        let ordered = store
            .addresses_with_status(Some(wallet.id), AddressStatus::Unused, None)
            .await
            .unwrap();
        assert_eq!(ordered[0].id, b.id);
        assert_eq!(ordered[1].id, a.id);
    }

    #[tokio::test]
    async fn test_tx_links_only_grow() {
        let store = MemoryStore::new();
        let wallet = store.get_or_create_wallet("xpub-a").await.unwrap();
        let a = store.create_address(wallet.id, 0, "bc1qa").await.unwrap();
        let b = store.create_address(wallet.id, 1, "bc1qb").await.unwrap();

        let tx = store
            .insert_tx(NewTx {
                txid: "txid-1".into(),
                block_height: Some(100),
                block_time: None,
                outputs: vec![],
            })
            .await
            .unwrap();
        store.link_tx_to_address(tx.id, a.id).await.unwrap();
        store.link_tx_to_address(tx.id, b.id).await.unwrap();
        store.link_tx_to_address(tx.id, a.id).await.unwrap();

        let stored = store.find_tx_by_txid("txid-1").await.unwrap().unwrap();
        assert_eq!(stored.linked_addresses.len(), 2);
        assert_eq!(store.txs_for_address(a.id).await.unwrap().len(), 1);
    }
}
