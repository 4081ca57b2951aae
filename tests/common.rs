#![allow(dead_code)]

/// Common test utilities for the payment gateway integration tests
///
/// Provides a programmable blockchain data source and a pre-wired harness
/// (in-memory store + engine + pool) shared by the test files.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::{Amount, Network};

use paywatch::chain::{ChainError, ChainSource, ChainTransaction, ChainTxOut};
use paywatch::derivation::AddressDeriver;
use paywatch::engine::ConfirmationEngine;
use paywatch::pool::AddressPool;
use paywatch::store::MemoryStore;
use paywatch::GatewayConfig;

// BIP32 test vectors 1 and 2, master keys
pub const XPUB_A: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
pub const XPUB_B: &str = "xpub661MyMwAqRbcFW31YEwpkMuc5THy2PSt5bDMsktWQcFF8syAmRUapSCGu8ED9W6oDMSgv6Zz8idoc4a6mr8BDzTJY47LJhkJ8UB7WEGuduB";

pub fn init_logger() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();
}

/// Scriptable chain source: payments are registered per address, failures
/// are queued up front, and call counts are observable.
pub struct MockChainSource {
    txs: Mutex<HashMap<String, Vec<ChainTransaction>>>,
    tip: Mutex<u64>,
    failures: Mutex<VecDeque<ChainError>>,
    tx_calls: Mutex<usize>,
    tip_calls: Mutex<usize>,
}

impl MockChainSource {
    pub fn new(tip: u64) -> Self {
        Self {
            txs: Mutex::new(HashMap::new()),
            tip: Mutex::new(tip),
            failures: Mutex::new(VecDeque::new()),
            tx_calls: Mutex::new(0),
            tip_calls: Mutex::new(0),
        }
    }

    pub fn add_payment(
        &self,
        address: &str,
        txid: &str,
        value: Amount,
        block_height: Option<u64>,
    ) {
        let tx = ChainTransaction {
            txid: txid.to_string(),
            block_height,
            block_time: None,
            outputs: vec![ChainTxOut {
                value,
                address: Some(address.to_string()),
            }],
            inputs: vec![],
        };
        self.txs
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(tx);
    }

    /// Register a transaction paying several addresses at once
    pub fn add_multi_payment(&self, txid: &str, outputs: &[(&str, Amount)], block_height: Option<u64>) {
        let tx = ChainTransaction {
            txid: txid.to_string(),
            block_height,
            block_time: None,
            outputs: outputs
                .iter()
                .map(|(address, value)| ChainTxOut {
                    value: *value,
                    address: Some(address.to_string()),
                })
                .collect(),
            inputs: vec![],
        };
        let mut txs = self.txs.lock().unwrap();
        for (address, _) in outputs {
            txs.entry(address.to_string()).or_default().push(tx.clone());
        }
    }

    /// Replace an address's recorded transactions (e.g. to confirm one)
    pub fn set_payments(&self, address: &str, payments: Vec<ChainTransaction>) {
        self.txs
            .lock()
            .unwrap()
            .insert(address.to_string(), payments);
    }

    /// The next transactions_received call fails with this error
    pub fn fail_next(&self, err: ChainError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_tip(&self, height: u64) {
        *self.tip.lock().unwrap() = height;
    }

    pub fn tx_call_count(&self) -> usize {
        *self.tx_calls.lock().unwrap()
    }

    pub fn tip_call_count(&self) -> usize {
        *self.tip_calls.lock().unwrap()
    }
}

#[async_trait]
impl ChainSource for MockChainSource {
    async fn transactions_received(
        &self,
        address: &str,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        *self.tx_calls.lock().unwrap() += 1;
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .txs
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn tip_height(&self) -> Result<u64, ChainError> {
        *self.tip_calls.lock().unwrap() += 1;
        Ok(*self.tip.lock().unwrap())
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MockChainSource>,
    pub engine: Arc<ConfirmationEngine>,
    pub pool: Arc<AddressPool>,
    pub deriver: AddressDeriver,
    pub config: GatewayConfig,
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        network: Network::Bitcoin,
        ..GatewayConfig::default()
    }
}

pub fn harness_at_tip(tip: u64) -> TestHarness {
    harness_with_config(tip, test_config())
}

pub fn harness_with_config(tip: u64, config: GatewayConfig) -> TestHarness {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(MockChainSource::new(tip));
    let engine = Arc::new(ConfirmationEngine::new(
        store.clone(),
        chain.clone(),
        &config,
    ));
    let deriver = AddressDeriver::new(config.network);
    let pool = Arc::new(AddressPool::new(
        store.clone(),
        engine.clone(),
        deriver.clone(),
        config.max_derivations_per_run,
    ));
    TestHarness {
        store,
        chain,
        engine,
        pool,
        deriver,
        config,
    }
}
