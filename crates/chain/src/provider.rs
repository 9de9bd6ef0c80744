//! RPC-backed [`ChainClient`] for the perpetuals contracts.
//! Uses Alloy typed contract bindings over HTTP.

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, I256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{ChainClient, OnChainPosition, PriceReading, TxReceipt};
use crate::contracts::{IPositionManager, IPositionRegistry, IPriceSource};
use crate::gas::GasParams;
use crate::signer::TransactionSender;

/// Deployed contract addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    /// Position manager (events, liquidation, funding)
    pub position_manager: Address,
    /// vAMM price source
    pub price_source: Address,
    /// Position NFT registry
    pub position_registry: Address,
}

/// Production chain adapter.
///
/// Reads go through short-lived HTTP providers; writes are signed and
/// submitted by the shared [`TransactionSender`].
#[derive(Clone)]
pub struct RpcChainClient {
    /// HTTP URL for reads and writes
    http_url: String,
    /// Contract addresses
    contracts: ContractAddresses,
    /// Signer shared by every write path
    sender: Arc<TransactionSender>,
}

impl RpcChainClient {
    /// Connect and verify the node.
    ///
    /// Fails when the node is unreachable or reports a chain id other
    /// than `expected_chain_id`.
    pub async fn new(
        http_url: &str,
        expected_chain_id: u64,
        contracts: ContractAddresses,
        sender: Arc<TransactionSender>,
    ) -> Result<Self> {
        info!(
            http = http_url,
            position_manager = %contracts.position_manager,
            price_source = %contracts.price_source,
            position_registry = %contracts.position_registry,
            "Initializing chain client"
        );

        let provider = ProviderBuilder::new().on_http(http_url.parse()?);
        let block = provider
            .get_block_number()
            .await
            .context("Failed to reach RPC node")?;
        let chain_id = provider.get_chain_id().await?;
        if chain_id != expected_chain_id {
            anyhow::bail!(
                "RPC node reports chain id {}, expected {}",
                chain_id,
                expected_chain_id
            );
        }
        info!(block = block, chain_id = chain_id, "Provider connection verified");

        Ok(Self {
            http_url: http_url.to_string(),
            contracts,
            sender,
        })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        Ok(provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let block = provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await
            .with_context(|| format!("eth_getBlockByNumber({}) failed", block))?
            .with_context(|| format!("block {} not found", block))?;
        Ok(block.header.timestamp)
    }

    async fn current_price(&self) -> Result<PriceReading> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let vamm = IPriceSource::new(self.contracts.price_source, &provider);
        let result = vamm
            .getCurrentPrice()
            .call()
            .await
            .context("getCurrentPrice failed")?;

        debug!(price = %result.price, valid = result.valid, "Mark price read");
        Ok(PriceReading {
            price: result.price,
            valid: result.valid,
        })
    }

    async fn accumulated_funding(&self) -> Result<I256> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let manager = IPositionManager::new(self.contracts.position_manager, &provider);
        let result = manager
            .fundingRateAccumulated()
            .call()
            .await
            .context("fundingRateAccumulated failed")?;
        Ok(result._0)
    }

    async fn current_funding_rate(&self) -> Result<I256> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let manager = IPositionManager::new(self.contracts.position_manager, &provider);
        let result = manager
            .getCurrentFundingRate()
            .call()
            .await
            .context("getCurrentFundingRate failed")?;
        Ok(result._0)
    }

    async fn position_data(&self, token_id: U256) -> Result<OnChainPosition> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let registry = IPositionRegistry::new(self.contracts.position_registry, &provider);
        let data = registry
            .getPositionData(token_id)
            .call()
            .await
            .with_context(|| format!("getPositionData({}) failed", token_id))?;

        Ok(OnChainPosition {
            collateral: data.collateral,
            leverage: data.leverage,
            entry_price: data.entryPrice,
            entry_funding_rate: data.entryFundingRate,
            is_long: data.isLong,
        })
    }

    async fn gas_params(&self) -> Result<GasParams> {
        self.sender.gas_params().await
    }

    async fn liquidate_position(&self, token_id: U256, gas: &GasParams) -> Result<TxReceipt> {
        let provider = ProviderBuilder::new()
            .wallet(self.sender.wallet())
            .on_http(self.http_url.parse()?);
        let manager = IPositionManager::new(self.contracts.position_manager, &provider);

        let call = manager.liquidatePosition(token_id).from(self.sender.address);
        let estimate = call
            .estimate_gas()
            .await
            .with_context(|| format!("Gas estimation for liquidatePosition({}) failed", token_id))?;

        self.sender
            .submit(
                &provider,
                call.into_transaction_request(),
                estimate,
                gas,
                "liquidatePosition",
            )
            .await
    }

    async fn update_funding_rate(&self, gas: &GasParams) -> Result<TxReceipt> {
        let provider = ProviderBuilder::new()
            .wallet(self.sender.wallet())
            .on_http(self.http_url.parse()?);
        let manager = IPositionManager::new(self.contracts.position_manager, &provider);

        let call = manager.updateFundingRate().from(self.sender.address);
        let estimate = call
            .estimate_gas()
            .await
            .context("Gas estimation for updateFundingRate failed")?;

        self.sender
            .submit(
                &provider,
                call.into_transaction_request(),
                estimate,
                gas,
                "updateFundingRate",
            )
            .await
    }
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("http_url", &self.http_url)
            .field("contracts", &self.contracts)
            .field("keeper", &self.sender.address)
            .finish()
    }
}
