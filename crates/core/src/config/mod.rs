//! Keeper configuration.
//!
//! Values come from the process environment (`.env` is loaded by the
//! binary), optionally layered over a TOML file named by `KEEPER_CONFIG`.
//! Environment values win. String values in the file may reference
//! `${ENV_VAR}`.

mod env;
mod keeper;

pub use env::{expand_env, overlay_env, FileConfig, RawValues, KEYS};
pub use keeper::{
    ConfigError, GasPricing, IndexerMode, KeeperConfig, LogFormat, DEFAULT_BACKFILL_BATCH_SIZE,
    DEFAULT_BACKFILL_RETRY_DELAY_MS, DEFAULT_CHAIN_ID, DEFAULT_DATABASE_URL,
    DEFAULT_FUNDING_RETRY_DELAY_MS, DEFAULT_FUNDING_UPDATE_INTERVAL_MS,
    DEFAULT_LIQUIDATION_CHECK_INTERVAL_MS, DEFAULT_MAX_GAS_PRICE_GWEI,
};
