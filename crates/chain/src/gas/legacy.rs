//! Legacy gas pricing strategy (pre-EIP-1559).

use super::{GasParams, GasStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Legacy gas pricing strategy.
///
/// Uses a single `gas_price` field read fresh from `eth_gasPrice` on every
/// call. A failed read is an error, never a stale price.
#[derive(Debug, Default)]
pub struct LegacyGasStrategy;

impl LegacyGasStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GasStrategy for LegacyGasStrategy {
    async fn fetch_params(&self, rpc_url: &str) -> Result<GasParams> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let gas_price = provider
            .get_gas_price()
            .await
            .context("eth_gasPrice failed")?;

        Ok(GasParams::Legacy { gas_price })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Legacy { gas_price } => {
                tx.set_gas_price(*gas_price);
            }
            GasParams::Eip1559 { max_fee_per_gas, .. } => {
                tx.set_gas_price(*max_fee_per_gas);
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "Legacy"
    }
}
