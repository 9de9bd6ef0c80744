//! Gas pricing for keeper transactions.
//!
//! A [`GasStrategy`] reads current network pricing and applies it to a
//! transaction request. The keeper compares [`GasParams::effective_gas_price`]
//! against its configured ceiling before submitting anything, so strategies
//! report the real network price and never clamp it.
//!
//! # Example
//!
//! ```rust,ignore
//! use keeper_chain::gas::{create_gas_strategy, apply_gas_buffer};
//!
//! let strategy = create_gas_strategy("legacy", None);
//! let params = strategy.fetch_params(rpc_url).await?;
//! let gas_limit = apply_gas_buffer(estimate);
//! ```

mod eip1559;
mod legacy;

pub use eip1559::Eip1559GasStrategy;
pub use legacy::LegacyGasStrategy;

use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Safety buffer added on top of `eth_estimateGas` (basis points, 2000 = 20%).
pub const GAS_LIMIT_BUFFER_BPS: u64 = 2_000;

const BPS_DENOMINATOR: u64 = 10_000;

/// Gas parameters fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasParams {
    /// Legacy gas pricing (pre-EIP-1559).
    Legacy {
        /// Gas price in wei.
        gas_price: u128,
    },
    /// EIP-1559 gas pricing.
    Eip1559 {
        /// Maximum fee per gas in wei.
        max_fee_per_gas: u128,
        /// Maximum priority fee per gas in wei.
        max_priority_fee_per_gas: u128,
        /// Current base fee (for reference).
        base_fee: u128,
    },
}

impl GasParams {
    /// Price compared against the keeper's gas ceiling.
    ///
    /// For EIP-1559 this is what a transaction pays at the current base fee
    /// (`base_fee + priority`), not the `max_fee_per_gas` headroom.
    pub fn effective_gas_price(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 {
                max_priority_fee_per_gas,
                base_fee,
                ..
            } => base_fee.saturating_add(*max_priority_fee_per_gas),
        }
    }

    /// Effective price in gwei (logging only).
    pub fn effective_gwei(&self) -> f64 {
        self.effective_gas_price() as f64 / 1e9
    }

    /// True if the effective price is strictly above `ceiling_wei`.
    pub fn exceeds(&self, ceiling_wei: u128) -> bool {
        self.effective_gas_price() > ceiling_wei
    }
}

/// Trait for gas pricing strategies.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Fetch current gas parameters from the given RPC URL.
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams>;

    /// Apply gas parameters to a transaction request.
    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams);

    /// Get the strategy name for logging/debugging.
    fn strategy_name(&self) -> &'static str;
}

/// Add the 20% safety buffer to a gas estimate.
pub fn apply_gas_buffer(estimate: u64) -> u64 {
    let buffered =
        (estimate as u128 * (BPS_DENOMINATOR + GAS_LIMIT_BUFFER_BPS) as u128) / BPS_DENOMINATOR as u128;
    buffered.min(u64::MAX as u128) as u64
}

/// Convert gwei (possibly fractional) to wei.
pub fn gwei_to_wei(gwei: f64) -> u128 {
    if gwei <= 0.0 {
        return 0;
    }
    (gwei * 1e9).round() as u128
}

/// Create a gas strategy from configuration.
///
/// # Arguments
/// * `pricing_model` - "legacy" or "eip1559"
/// * `priority_fee_gwei` - Priority fee in gwei (for EIP-1559)
pub fn create_gas_strategy(
    pricing_model: &str,
    priority_fee_gwei: Option<f64>,
) -> Box<dyn GasStrategy> {
    match pricing_model.to_lowercase().as_str() {
        "eip1559" | "eip-1559" => {
            let priority_fee = priority_fee_gwei.unwrap_or(2.0);
            Box::new(Eip1559GasStrategy::new(gwei_to_wei(priority_fee), 2.0))
        }
        _ => Box::new(LegacyGasStrategy::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_params_effective_price() {
        let legacy = GasParams::Legacy {
            gas_price: 1_000_000_000,
        };
        assert_eq!(legacy.effective_gas_price(), 1_000_000_000);

        let eip1559 = GasParams::Eip1559 {
            max_fee_per_gas: 50_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            base_fee: 30_000_000_000,
        };
        assert_eq!(eip1559.effective_gas_price(), 32_000_000_000);
    }

    #[test]
    fn test_eip1559_ceiling_uses_base_plus_priority() {
        // 20 gwei base, 2 gwei tip, max fee doubled base plus tip
        let params = GasParams::Eip1559 {
            max_fee_per_gas: 42_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            base_fee: 20_000_000_000,
        };

        // 22 gwei paid is under a 30 gwei ceiling even though max fee is not
        assert!(!params.exceeds(gwei_to_wei(30.0)));
        assert!(!params.exceeds(gwei_to_wei(22.0)));
        assert!(params.exceeds(gwei_to_wei(21.0)));
    }

    #[test]
    fn test_ceiling_comparison_is_strict() {
        let at_ceiling = GasParams::Legacy {
            gas_price: 50_000_000_000,
        };
        assert!(!at_ceiling.exceeds(gwei_to_wei(50.0)));
        assert!(at_ceiling.exceeds(gwei_to_wei(49.9)));
    }

    #[test]
    fn test_apply_gas_buffer() {
        assert_eq!(apply_gas_buffer(100_000), 120_000);
        assert_eq!(apply_gas_buffer(21_001), 25_201);
        assert_eq!(apply_gas_buffer(0), 0);
    }

    #[test]
    fn test_gwei_to_wei() {
        assert_eq!(gwei_to_wei(1.0), 1_000_000_000);
        assert_eq!(gwei_to_wei(0.5), 500_000_000);
        assert_eq!(gwei_to_wei(-3.0), 0);
    }

    #[test]
    fn test_create_gas_strategy() {
        let legacy = create_gas_strategy("legacy", None);
        assert_eq!(legacy.strategy_name(), "Legacy");

        let eip1559 = create_gas_strategy("Eip1559", Some(2.0));
        assert_eq!(eip1559.strategy_name(), "EIP-1559");

        // Unknown defaults to Legacy
        let unknown = create_gas_strategy("Unknown", None);
        assert_eq!(unknown.strategy_name(), "Legacy");
    }
}
