//! Capability interface the keeper needs from the chain.
//!
//! The keeper never touches contract handles directly: every read and write
//! goes through [`ChainClient`], implemented for production by
//! [`RpcChainClient`](crate::RpcChainClient). Tests substitute their own
//! implementation.

use alloy::primitives::{B256, I256, U256};
use anyhow::Result;
use async_trait::async_trait;

use crate::gas::GasParams;

/// Mark price read from the price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceReading {
    /// Price (18-decimal fixed point)
    pub price: U256,
    /// False when the price source reports a stale or unusable price
    pub valid: bool,
}

/// Position data read directly from the position registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainPosition {
    pub collateral: U256,
    pub leverage: U256,
    pub entry_price: U256,
    pub entry_funding_rate: I256,
    pub is_long: bool,
}

/// Confirmed (successful) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
}

/// Typed read/write access to the perpetuals contracts.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block.
    async fn block_number(&self) -> Result<u64>;

    /// Timestamp (unix seconds) of a mined block.
    async fn block_timestamp(&self, block: u64) -> Result<u64>;

    /// Current mark price and its validity flag.
    async fn current_price(&self) -> Result<PriceReading>;

    /// Accumulated funding rate (10,000 = 100%).
    async fn accumulated_funding(&self) -> Result<I256>;

    /// Current per-period funding rate (10,000 = 100%).
    async fn current_funding_rate(&self) -> Result<I256>;

    /// Position data for one token.
    async fn position_data(&self, token_id: U256) -> Result<OnChainPosition>;

    /// Current network gas pricing.
    async fn gas_params(&self) -> Result<GasParams>;

    /// Submit `liquidatePosition(tokenId)` and wait for the receipt.
    ///
    /// A reverted transaction is returned as an error.
    async fn liquidate_position(&self, token_id: U256, gas: &GasParams) -> Result<TxReceipt>;

    /// Submit `updateFundingRate()` and wait for the receipt.
    async fn update_funding_rate(&self, gas: &GasParams) -> Result<TxReceipt>;
}
