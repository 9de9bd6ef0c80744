//! Validated keeper configuration.

use alloy::primitives::Address;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::env::{overlay_env, FileConfig, RawValues};

/// Sepolia
pub const DEFAULT_CHAIN_ID: u64 = 11_155_111;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://keeper.db?mode=rwc";
pub const DEFAULT_LIQUIDATION_CHECK_INTERVAL_MS: u64 = 60_000;
/// 8 hours
pub const DEFAULT_FUNDING_UPDATE_INTERVAL_MS: u64 = 28_800_000;
pub const DEFAULT_MAX_GAS_PRICE_GWEI: f64 = 50.0;
pub const DEFAULT_BACKFILL_BATCH_SIZE: u64 = 2_000;
pub const DEFAULT_BACKFILL_RETRY_DELAY_MS: u64 = 5_000;
/// 5 minutes
pub const DEFAULT_FUNDING_RETRY_DELAY_MS: u64 = 300_000;

const REQUIRED: &[&str] = &[
    "RPC_HTTP_URL",
    "POSITION_MANAGER_ADDRESS",
    "VAMM_ADDRESS",
    "POSITION_NFT_ADDRESS",
    "PRIVATE_KEY",
];

/// Startup configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Where the indexer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerMode {
    /// `latest`: subscribe from the current head, no replay
    LiveOnly,
    /// `checkpoint`: replay from the persisted checkpoint, then subscribe
    BackfillThenLive,
}

impl FromStr for IndexerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest" => Ok(Self::LiveOnly),
            "checkpoint" => Ok(Self::BackfillThenLive),
            other => Err(format!("expected 'latest' or 'checkpoint', got '{}'", other)),
        }
    }
}

impl fmt::Display for IndexerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LiveOnly => write!(f, "live-only"),
            Self::BackfillThenLive => write!(f, "backfill-then-live"),
        }
    }
}

/// Transaction pricing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPricing {
    Legacy,
    Eip1559,
}

impl GasPricing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Eip1559 => "eip1559",
        }
    }
}

impl FromStr for GasPricing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "eip1559" | "eip-1559" => Ok(Self::Eip1559),
            other => Err(format!("expected 'legacy' or 'eip1559', got '{}'", other)),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{}'", other)),
        }
    }
}

/// Fully validated configuration.
#[derive(Clone)]
pub struct KeeperConfig {
    pub rpc_http_url: String,
    pub rpc_ws_url: Option<String>,
    pub chain_id: u64,
    pub position_manager: Address,
    pub vamm: Address,
    pub position_nft: Address,
    /// Hex signing key, never logged
    pub private_key: String,
    pub database_url: String,
    pub liquidation_check_interval: Duration,
    pub funding_update_interval: Duration,
    pub max_gas_price_gwei: f64,
    pub indexer_mode: IndexerMode,
    pub backfill_batch_size: u64,
    pub backfill_retry_delay: Duration,
    pub funding_retry_delay: Duration,
    pub gas_pricing: GasPricing,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl fmt::Debug for KeeperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeeperConfig")
            .field("rpc_http_url", &self.rpc_http_url)
            .field("rpc_ws_url", &self.rpc_ws_url)
            .field("chain_id", &self.chain_id)
            .field("position_manager", &self.position_manager)
            .field("vamm", &self.vamm)
            .field("position_nft", &self.position_nft)
            .field("private_key", &"<redacted>")
            .field("database_url", &self.database_url)
            .field("liquidation_check_interval", &self.liquidation_check_interval)
            .field("funding_update_interval", &self.funding_update_interval)
            .field("max_gas_price_gwei", &self.max_gas_price_gwei)
            .field("indexer_mode", &self.indexer_mode)
            .field("backfill_batch_size", &self.backfill_batch_size)
            .field("backfill_retry_delay", &self.backfill_retry_delay)
            .field("funding_retry_delay", &self.funding_retry_delay)
            .field("gas_pricing", &self.gas_pricing)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

/// Accumulates validation problems so every one is reported at once.
struct Validator<'a> {
    values: &'a RawValues,
    invalid: Vec<ConfigError>,
}

impl<'a> Validator<'a> {
    fn raw(&self, key: &'static str) -> Option<&'a str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&mut self, key: &'static str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(e) => {
                    self.invalid.push(ConfigError::Invalid {
                        key,
                        reason: format!("'{}': {}", raw, e),
                    });
                    default
                }
            },
        }
    }

    fn positive_millis(&mut self, key: &'static str, default_ms: u64) -> Duration {
        let ms = self.parse(key, default_ms);
        if ms == 0 {
            self.reject(key, "must be greater than zero");
        }
        Duration::from_millis(ms)
    }

    fn address(&mut self, key: &'static str) -> Address {
        self.parse(key, Address::ZERO)
    }

    fn reject(&mut self, key: &'static str, reason: impl Into<String>) {
        self.invalid.push(ConfigError::Invalid {
            key,
            reason: reason.into(),
        });
    }
}

impl KeeperConfig {
    /// Load from `KEEPER_CONFIG` (optional TOML) overlaid with the process
    /// environment. Call after `.env` has been loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("KEEPER_CONFIG") {
            Ok(path) if !path.trim().is_empty() => FileConfig::from_file(path.trim())?.into_values(),
            _ => RawValues::new(),
        };
        let values = overlay_env(base, |key| std::env::var(key).ok());
        Self::from_values(&values)
    }

    /// Validate raw values. Missing required keys are reported together,
    /// before any value-level error.
    pub fn from_values(values: &RawValues) -> Result<Self, ConfigError> {
        let missing: Vec<&'static str> = REQUIRED
            .iter()
            .copied()
            .filter(|key| values.get(key).map_or(true, |v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let mut v = Validator {
            values,
            invalid: Vec::new(),
        };

        let rpc_http_url = v.raw("RPC_HTTP_URL").unwrap_or_default().to_string();
        let rpc_ws_url = v.raw("RPC_WS_URL").map(str::to_string);
        let chain_id = v.parse("CHAIN_ID", DEFAULT_CHAIN_ID);
        let position_manager = v.address("POSITION_MANAGER_ADDRESS");
        let vamm = v.address("VAMM_ADDRESS");
        let position_nft = v.address("POSITION_NFT_ADDRESS");

        let private_key = v.raw("PRIVATE_KEY").unwrap_or_default().to_string();
        let key_hex = private_key.trim_start_matches("0x");
        if key_hex.len() != 64 || !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            v.reject("PRIVATE_KEY", "expected 32 bytes of hex");
        }

        let database_url = v
            .raw("DATABASE_URL")
            .unwrap_or(DEFAULT_DATABASE_URL)
            .to_string();
        let liquidation_check_interval =
            v.positive_millis("LIQUIDATION_CHECK_INTERVAL", DEFAULT_LIQUIDATION_CHECK_INTERVAL_MS);
        let funding_update_interval =
            v.positive_millis("FUNDING_UPDATE_INTERVAL", DEFAULT_FUNDING_UPDATE_INTERVAL_MS);

        let max_gas_price_gwei = v.parse("MAX_GAS_PRICE", DEFAULT_MAX_GAS_PRICE_GWEI);
        if !max_gas_price_gwei.is_finite() || max_gas_price_gwei <= 0.0 {
            v.reject("MAX_GAS_PRICE", "must be a positive number of gwei");
        }

        let indexer_mode = v.parse("START_BLOCK", IndexerMode::LiveOnly);
        let backfill_batch_size = v.parse("BACKFILL_BATCH_SIZE", DEFAULT_BACKFILL_BATCH_SIZE);
        if backfill_batch_size == 0 {
            v.reject("BACKFILL_BATCH_SIZE", "must be greater than zero");
        }
        let backfill_retry_delay =
            v.positive_millis("BACKFILL_RETRY_DELAY", DEFAULT_BACKFILL_RETRY_DELAY_MS);
        let funding_retry_delay =
            v.positive_millis("FUNDING_RETRY_DELAY", DEFAULT_FUNDING_RETRY_DELAY_MS);
        let gas_pricing = v.parse("GAS_PRICING", GasPricing::Legacy);
        let log_level = v.raw("LOG_LEVEL").unwrap_or("info").to_string();
        let log_format = v.parse("LOG_FORMAT", LogFormat::Pretty);

        if let Some(first) = v.invalid.into_iter().next() {
            return Err(first);
        }

        Ok(Self {
            rpc_http_url,
            rpc_ws_url,
            chain_id,
            position_manager,
            vamm,
            position_nft,
            private_key,
            database_url,
            liquidation_check_interval,
            funding_update_interval,
            max_gas_price_gwei,
            indexer_mode,
            backfill_batch_size,
            backfill_retry_delay,
            funding_retry_delay,
            gas_pricing,
            log_level,
            log_format,
        })
    }

    /// Gas ceiling in wei.
    pub fn max_gas_price_wei(&self) -> u128 {
        (self.max_gas_price_gwei * 1e9).round() as u128
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!(
            chain_id = self.chain_id,
            http = %self.rpc_http_url,
            ws = self.rpc_ws_url.as_deref().unwrap_or("<disabled>"),
            "Keeper configuration loaded"
        );
        info!(
            position_manager = %self.position_manager,
            vamm = %self.vamm,
            position_nft = %self.position_nft,
            "Contracts"
        );
        info!(
            liquidation_interval_ms = self.liquidation_check_interval.as_millis() as u64,
            funding_interval_ms = self.funding_update_interval.as_millis() as u64,
            funding_retry_ms = self.funding_retry_delay.as_millis() as u64,
            max_gas_price_gwei = self.max_gas_price_gwei,
            gas_pricing = self.gas_pricing.as_str(),
            "Schedules"
        );
        info!(
            mode = %self.indexer_mode,
            batch_size = self.backfill_batch_size,
            retry_ms = self.backfill_retry_delay.as_millis() as u64,
            "Indexer"
        );
    }
}
