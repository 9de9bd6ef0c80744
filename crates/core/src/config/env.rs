//! Raw configuration sources: process environment and optional TOML file.

use regex_lite::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use super::ConfigError;

/// Every recognized key, in environment-variable form.
pub const KEYS: &[&str] = &[
    "RPC_HTTP_URL",
    "RPC_WS_URL",
    "CHAIN_ID",
    "POSITION_MANAGER_ADDRESS",
    "VAMM_ADDRESS",
    "POSITION_NFT_ADDRESS",
    "PRIVATE_KEY",
    "DATABASE_URL",
    "LIQUIDATION_CHECK_INTERVAL",
    "FUNDING_UPDATE_INTERVAL",
    "MAX_GAS_PRICE",
    "START_BLOCK",
    "BACKFILL_BATCH_SIZE",
    "BACKFILL_RETRY_DELAY",
    "FUNDING_RETRY_DELAY",
    "GAS_PRICING",
    "LOG_LEVEL",
    "LOG_FORMAT",
];

/// Key -> raw string value, after layering.
pub type RawValues = BTreeMap<&'static str, String>;

/// TOML file layout: the same keys in snake_case.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub rpc_http_url: Option<String>,
    pub rpc_ws_url: Option<String>,
    pub chain_id: Option<u64>,
    pub position_manager_address: Option<String>,
    pub vamm_address: Option<String>,
    pub position_nft_address: Option<String>,
    pub private_key: Option<String>,
    pub database_url: Option<String>,
    pub liquidation_check_interval: Option<u64>,
    pub funding_update_interval: Option<u64>,
    pub max_gas_price: Option<f64>,
    pub start_block: Option<String>,
    pub backfill_batch_size: Option<u64>,
    pub backfill_retry_delay: Option<u64>,
    pub funding_retry_delay: Option<u64>,
    pub gas_pricing: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl FileConfig {
    /// Load a config file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })
    }

    /// Flatten into raw values, expanding `${VAR}` in string fields.
    pub fn into_values(self) -> RawValues {
        let mut values = RawValues::new();
        let mut put = |key: &'static str, value: Option<String>| {
            if let Some(v) = value {
                values.insert(key, v);
            }
        };

        put("RPC_HTTP_URL", self.rpc_http_url.map(|s| expand_env(&s)));
        put("RPC_WS_URL", self.rpc_ws_url.map(|s| expand_env(&s)));
        put("CHAIN_ID", self.chain_id.map(|v| v.to_string()));
        put(
            "POSITION_MANAGER_ADDRESS",
            self.position_manager_address.map(|s| expand_env(&s)),
        );
        put("VAMM_ADDRESS", self.vamm_address.map(|s| expand_env(&s)));
        put(
            "POSITION_NFT_ADDRESS",
            self.position_nft_address.map(|s| expand_env(&s)),
        );
        put("PRIVATE_KEY", self.private_key.map(|s| expand_env(&s)));
        put("DATABASE_URL", self.database_url.map(|s| expand_env(&s)));
        put(
            "LIQUIDATION_CHECK_INTERVAL",
            self.liquidation_check_interval.map(|v| v.to_string()),
        );
        put(
            "FUNDING_UPDATE_INTERVAL",
            self.funding_update_interval.map(|v| v.to_string()),
        );
        put("MAX_GAS_PRICE", self.max_gas_price.map(|v| v.to_string()));
        put("START_BLOCK", self.start_block);
        put(
            "BACKFILL_BATCH_SIZE",
            self.backfill_batch_size.map(|v| v.to_string()),
        );
        put(
            "BACKFILL_RETRY_DELAY",
            self.backfill_retry_delay.map(|v| v.to_string()),
        );
        put(
            "FUNDING_RETRY_DELAY",
            self.funding_retry_delay.map(|v| v.to_string()),
        );
        put("GAS_PRICING", self.gas_pricing);
        put("LOG_LEVEL", self.log_level);
        put("LOG_FORMAT", self.log_format);
        values
    }
}

/// Overlay environment values on top of `base`. Empty variables are ignored.
pub fn overlay_env<F>(mut base: RawValues, lookup: F) -> RawValues
where
    F: Fn(&str) -> Option<String>,
{
    for &key in KEYS {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
            base.insert(key, value);
        }
    }
    base
}

fn env_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
/// Unset variables are left as-is.
pub fn expand_env(s: &str) -> String {
    let mut result = s.to_string();
    let Some(pattern) = env_pattern() else {
        return result;
    };

    for cap in pattern.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    result
}
