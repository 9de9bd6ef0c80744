//! EIP-1559 gas pricing strategy.

use super::{GasParams, GasStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;

/// EIP-1559 gas pricing strategy.
///
/// max_fee = base_fee * multiplier + priority_fee. The max fee only bounds
/// what the transaction may pay; the keeper's gas ceiling is compared
/// against base_fee + priority_fee.
#[derive(Debug)]
pub struct Eip1559GasStrategy {
    /// Default priority fee (tip) in wei.
    default_priority_fee: u128,
    /// Multiplier for max_fee relative to base_fee (e.g., 2.0 = survives one doubling).
    max_fee_multiplier: f64,
}

impl Eip1559GasStrategy {
    /// # Arguments
    /// * `default_priority_fee` - Priority fee (tip) in wei when the node offers none
    /// * `max_fee_multiplier` - Multiplier applied to the base fee
    pub fn new(default_priority_fee: u128, max_fee_multiplier: f64) -> Self {
        Self {
            default_priority_fee,
            max_fee_multiplier,
        }
    }

    fn calculate_max_fee(&self, base_fee: u128, priority_fee: u128) -> u128 {
        ((base_fee as f64) * self.max_fee_multiplier) as u128 + priority_fee
    }
}

#[async_trait]
impl GasStrategy for Eip1559GasStrategy {
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);

        let block = provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to get latest block"))?;

        let base_fee = block
            .header
            .base_fee_per_gas
            .map(|b| b as u128)
            .ok_or_else(|| anyhow::anyhow!("Latest block has no base fee (chain is not EIP-1559)"))?;

        let priority_fee = provider
            .get_max_priority_fee_per_gas()
            .await
            .unwrap_or(self.default_priority_fee);

        Ok(GasParams::Eip1559 {
            max_fee_per_gas: self.calculate_max_fee(base_fee, priority_fee),
            max_priority_fee_per_gas: priority_fee,
            base_fee,
        })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                ..
            } => {
                tx.set_max_fee_per_gas(*max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(*max_priority_fee_per_gas);
            }
            GasParams::Legacy { gas_price } => {
                tx.set_max_fee_per_gas(*gas_price);
                tx.set_max_priority_fee_per_gas(self.default_priority_fee.min(*gas_price));
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "EIP-1559"
    }
}
