//! Process wiring and coordinated shutdown.
//!
//! Builds every component once, runs the three loops as independent tasks,
//! and tears them down in order: stop new iterations, let in-flight calls
//! finish, then close the store.

use anyhow::{Context, Result};
use keeper_chain::{
    gas::create_gas_strategy, ChainClient, ContractAddresses, EventListener, PositionEventSource,
    RpcChainClient, TransactionSender,
};
use keeper_store::PositionStore;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::KeeperConfig;
use crate::funding::FundingUpdater;
use crate::indexer::{Indexer, IndexerError, IndexerSettings};
use crate::liquidator::Liquidator;
use crate::shutdown::Shutdown;

pub struct Orchestrator {
    config: KeeperConfig,
    chain: Arc<dyn ChainClient>,
    events: Arc<dyn PositionEventSource>,
    store: PositionStore,
    shutdown: Shutdown,
}

impl Orchestrator {
    /// Connect the store and the chain. Fails fast if either is unreachable.
    pub async fn connect(config: KeeperConfig) -> Result<Self> {
        let store = PositionStore::connect(&config.database_url).await?;
        let checkpoint = store.checkpoint().await?;
        info!(
            positions = store.count_positions().await?,
            active = store.active_positions().await?.len(),
            checkpoint = checkpoint.last_processed_block,
            "Position store loaded"
        );

        let gas_strategy = create_gas_strategy(config.gas_pricing.as_str(), None);
        let sender = Arc::new(
            TransactionSender::new(
                &config.private_key,
                &config.rpc_http_url,
                config.chain_id,
                gas_strategy,
            )
            .await
            .context("Failed to initialize transaction sender")?,
        );
        info!(address = %sender.address, gas = sender.gas_strategy_name(), "Keeper wallet ready");

        let contracts = ContractAddresses {
            position_manager: config.position_manager,
            price_source: config.vamm,
            position_registry: config.position_nft,
        };
        let chain = RpcChainClient::new(&config.rpc_http_url, config.chain_id, contracts, sender)
            .await
            .context("Chain connectivity check failed")?;

        let events = EventListener::new(
            config.rpc_http_url.clone(),
            config.rpc_ws_url.clone(),
            config.position_manager,
        );

        Ok(Self::from_parts(
            config,
            Arc::new(chain),
            Arc::new(events),
            store,
        ))
    }

    /// Assemble from already built parts.
    pub fn from_parts(
        config: KeeperConfig,
        chain: Arc<dyn ChainClient>,
        events: Arc<dyn PositionEventSource>,
        store: PositionStore,
    ) -> Self {
        Self {
            config,
            chain,
            events,
            store,
            shutdown: Shutdown::new(),
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until `signal` resolves or the indexer fails.
    ///
    /// Returns `Ok` on a signal-driven shutdown and the indexer's error when
    /// the live event stream is lost or a live event cannot be applied.
    pub async fn run<F>(self, signal: F) -> Result<(), IndexerError>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let max_gas_price = config.max_gas_price_wei();

        let indexer = Indexer::new(
            self.chain.clone(),
            self.events.clone(),
            self.store.clone(),
            IndexerSettings {
                mode: config.indexer_mode,
                batch_size: config.backfill_batch_size,
                retry_delay: config.backfill_retry_delay,
            },
            self.shutdown.clone(),
        );
        let liquidator = Liquidator::new(
            self.chain.clone(),
            self.store.clone(),
            config.liquidation_check_interval,
            max_gas_price,
            self.shutdown.clone(),
        );
        let funding = FundingUpdater::new(
            self.chain.clone(),
            self.store.clone(),
            config.funding_update_interval,
            config.funding_retry_delay,
            max_gas_price,
            self.shutdown.clone(),
        );

        let mut indexer_task = tokio::spawn(async move { indexer.run().await });
        let liquidator_task = tokio::spawn(async move { liquidator.run().await });
        let funding_task = tokio::spawn(async move { funding.run().await });
        info!("Keeper running");

        let early_exit = tokio::select! {
            _ = signal => {
                info!("Shutdown signal received");
                None
            }
            joined = &mut indexer_task => Some(joined),
        };

        self.shutdown.trigger();
        let indexer_result = match early_exit {
            Some(joined) => joined,
            None => indexer_task.await,
        };

        join_loop("liquidator", liquidator_task).await;
        join_loop("funding updater", funding_task).await;

        self.store.close().await;

        match indexer_result {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Indexer task panicked");
                Err(IndexerError::Aborted(e.to_string()))
            }
        }
    }
}

async fn join_loop(name: &'static str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(task = name, error = %e, "Task panicked");
    }
}
