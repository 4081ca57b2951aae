/// Gateway configuration from environment variables
///
/// Controls Bitcoin network type, the Esplora API endpoint, and the
/// tunables of pool maintenance and payment checking.
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Bitcoin network type
    pub network: bitcoin::Network,
    /// Esplora API base URL
    pub esplora_url: String,
    /// Block confirmations required before received funds count as paid
    pub required_confirmations: u64,
    /// Verified-unused addresses to keep available per wallet
    pub pool_target: usize,
    /// How long a fetched blockchain height stays fresh (one inter-block interval)
    pub height_cache_ttl: Duration,
    /// Delay between re-checks of assigned addresses
    pub check_interval: Duration,
    /// Retry delay after a transport failure, and the fallback when a
    /// rate-limit response carries no reset time
    pub retry_delay: Duration,
    /// Cap on derivations per wallet within one convergence run
    pub max_derivations_per_run: u32,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BITCOIN_NETWORK`: "signet" (default), "regtest", "testnet" or "mainnet"
    /// - `ESPLORA_URL`: Esplora API endpoint (optional, has per-network defaults)
    /// - `REQUIRED_CONFIRMATIONS`: blocks before a payment counts (default 3)
    /// - `POOL_TARGET`: verified-unused addresses kept per wallet (default 2)
    pub fn from_env() -> Self {
        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "signet".to_string())
            .to_lowercase();

        let network = match network_str.as_str() {
            "mainnet" | "bitcoin" => {
                log::info!("🌐 Using MAINNET network");
                bitcoin::Network::Bitcoin
            }
            "testnet" => {
                log::info!("🌐 Using TESTNET network");
                bitcoin::Network::Testnet
            }
            "regtest" => {
                log::info!("🔧 Using REGTEST network");
                bitcoin::Network::Regtest
            }
            "signet" | "" => {
                log::info!("🌐 Using SIGNET network");
                bitcoin::Network::Signet
            }
            other => {
                log::warn!("Unknown network '{}', defaulting to Signet", other);
                bitcoin::Network::Signet
            }
        };

        let esplora_url = env::var("ESPLORA_URL").unwrap_or_else(|_| {
            let default_url = match network {
                bitcoin::Network::Bitcoin => "https://mempool.space/api",
                bitcoin::Network::Testnet => "https://mempool.space/testnet/api",
                bitcoin::Network::Regtest => "http://localhost:3000",
                _ => "https://mempool.space/signet/api",
            };
            log::info!("📡 Esplora URL: {} (default)", default_url);
            default_url.to_string()
        });

        let required_confirmations = parse_env("REQUIRED_CONFIRMATIONS", 3);
        let pool_target = parse_env("POOL_TARGET", 2);
        let max_derivations_per_run = parse_env("MAX_DERIVATIONS_PER_RUN", 250);

        Self {
            network,
            esplora_url,
            required_confirmations,
            pool_target,
            max_derivations_per_run,
            ..Self::default()
        }
    }
}

fn parse_env<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparseable {}={}, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

impl Default for GatewayConfig {
    /// Default configuration (Signet)
    fn default() -> Self {
        Self {
            network: bitcoin::Network::Signet,
            esplora_url: "https://mempool.space/signet/api".to_string(),
            required_confirmations: 3,
            pool_target: 2,
            height_cache_ttl: Duration::from_secs(600),
            check_interval: Duration::from_secs(600),
            retry_delay: Duration::from_secs(900),
            max_derivations_per_run: 250,
        }
    }
}
