//! Esplora REST adapter
//!
//! Works against any Esplora-compatible endpoint (mempool.space, electrs,
//! a local mock). Pagination follows the API's chained-txs scheme; a 429
//! response surfaces as [`ChainError::RateLimited`] carrying the
//! `Retry-After` reset time when the server sends one.

use bitcoin::Amount;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{ChainError, ChainSource, ChainTransaction, ChainTxIn, ChainTxOut};

/// Confirmed transactions per page of `/address/{addr}/txs/chain`
const PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraTxStatus,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
    block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVin {
    prevout: Option<EsploraVout>,
}

pub struct EsploraClient {
    base_url: String,
    client: reqwest::Client,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        log::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(|secs| Utc::now() + Duration::seconds(secs));
            log::warn!("Esplora rate limit hit on {} (reset {:?})", path, reset_at);
            return Err(ChainError::RateLimited { reset_at });
        }

        if !response.status().is_success() {
            return Err(ChainError::Unavailable(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }

        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))
    }

    fn normalize(tx: EsploraTx) -> ChainTransaction {
        let block_height = tx.status.confirmed.then_some(tx.status.block_height).flatten();
        let block_time = tx
            .status
            .block_time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0));
        ChainTransaction {
            txid: tx.txid,
            block_height,
            block_time,
            outputs: tx
                .vout
                .into_iter()
                .map(|out| ChainTxOut {
                    value: Amount::from_sat(out.value),
                    address: out.scriptpubkey_address,
                })
                .collect(),
            inputs: tx
                .vin
                .into_iter()
                .map(|vin| match vin.prevout {
                    Some(prev) => ChainTxIn {
                        value: Amount::from_sat(prev.value),
                        address: prev.scriptpubkey_address,
                    },
                    None => ChainTxIn {
                        value: Amount::ZERO,
                        address: None,
                    },
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl ChainSource for EsploraClient {
    async fn transactions_received(
        &self,
        address: &str,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        // First page: mempool transactions plus the most recent confirmed ones
        let mut raw: Vec<EsploraTx> = self
            .get_json(&format!("/address/{}/txs", address))
            .await?;

        // Older confirmed history is paged behind the last seen txid
        loop {
            let confirmed: Vec<&EsploraTx> = raw.iter().filter(|t| t.status.confirmed).collect();
            if confirmed.len() % PAGE_SIZE != 0 || confirmed.is_empty() {
                break;
            }
            let last_txid = match confirmed.last() {
                Some(tx) => tx.txid.clone(),
                None => break,
            };
            let page: Vec<EsploraTx> = self
                .get_json(&format!("/address/{}/txs/chain/{}", address, last_txid))
                .await?;
            if page.is_empty() {
                break;
            }
            raw.extend(page);
        }

        let transactions: Vec<ChainTransaction> = raw
            .into_iter()
            .map(Self::normalize)
            .filter(|tx| tx.pays(address))
            .collect();

        log::debug!(
            "{} received {} transaction(s)",
            address,
            transactions.len()
        );
        Ok(transactions)
    }

    async fn tip_height(&self) -> Result<u64, ChainError> {
        let body = self
            .get("/blocks/tip/height")
            .await?
            .text()
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        body.trim()
            .parse()
            .map_err(|e| ChainError::Unavailable(format!("bad tip height '{}': {}", body, e)))
    }
}
