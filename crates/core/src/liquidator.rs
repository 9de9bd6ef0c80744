//! Periodic solvency sweep and liquidation submission.

use alloy::primitives::U256;
use anyhow::{bail, Context, Result};
use keeper_chain::{ChainClient, TxReceipt};
use keeper_store::{LiquidationAttempt, Position, PositionStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::fixed_math::wad_to_f64;
use crate::risk::{assess, MarketSnapshot, RiskAssessment, RiskInputs};
use crate::shutdown::Shutdown;

/// What happened to one position in a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationOutcome {
    /// Above maintenance margin
    Healthy,
    /// Confirmed on chain
    Liquidated(TxReceipt),
    /// Submission failed or reverted
    Failed(String),
    /// Gas above the ceiling, re-evaluated next sweep
    GasTooHigh,
}

/// Per-sweep counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub liquidatable: usize,
    pub liquidated: usize,
    pub failed: usize,
    pub deferred_gas: usize,
    /// Positions that could not be evaluated or stamped
    pub errors: usize,
}

pub struct Liquidator {
    chain: Arc<dyn ChainClient>,
    store: PositionStore,
    interval: Duration,
    /// Gas ceiling in wei
    max_gas_price: u128,
    shutdown: Shutdown,
}

impl Liquidator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: PositionStore,
        interval: Duration,
        max_gas_price: u128,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain,
            store,
            interval,
            max_gas_price,
            shutdown,
        }
    }

    /// Sweep every `interval` until shutdown. The first sweep runs immediately.
    pub async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            max_gas_gwei = self.max_gas_price as f64 / 1e9,
            "Liquidator starting"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                warn!(error = %format!("{:#}", e), "Liquidation sweep aborted");
            }
        }

        info!("Liquidator stopped");
    }

    /// One pass over all active positions against a single market snapshot.
    ///
    /// Returns an error only when the snapshot itself cannot be taken.
    #[instrument(skip(self), name = "sweep")]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let start = Instant::now();
        let positions = self
            .store
            .active_positions()
            .await
            .context("Failed to load active positions")?;

        if positions.is_empty() {
            debug!("No active positions");
            return Ok(SweepReport::default());
        }

        let market = self.snapshot().await?;
        debug!(
            positions = positions.len(),
            price = wad_to_f64(market.price),
            accumulated_funding = %market.accumulated_funding,
            "Sweep started"
        );

        let mut report = SweepReport::default();
        for position in &positions {
            report.evaluated += 1;

            match self.process(position, &market).await {
                Ok(LiquidationOutcome::Healthy) => {}
                Ok(LiquidationOutcome::Liquidated(_)) => {
                    report.liquidatable += 1;
                    report.liquidated += 1;
                }
                Ok(LiquidationOutcome::Failed(_)) => {
                    report.liquidatable += 1;
                    report.failed += 1;
                }
                Ok(LiquidationOutcome::GasTooHigh) => {
                    report.liquidatable += 1;
                    report.deferred_gas += 1;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(
                        token_id = %position.token_id,
                        error = %format!("{:#}", e),
                        "Failed to evaluate position"
                    );
                }
            }

            // Stamped whatever the outcome
            if let Err(e) = self.store.touch_last_checked(position.token_id).await {
                report.errors += 1;
                warn!(token_id = %position.token_id, error = %e, "Failed to stamp last_checked");
            }
        }

        info!(
            evaluated = report.evaluated,
            liquidatable = report.liquidatable,
            liquidated = report.liquidated,
            failed = report.failed,
            deferred_gas = report.deferred_gas,
            errors = report.errors,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sweep complete"
        );

        Ok(report)
    }

    async fn snapshot(&self) -> Result<MarketSnapshot> {
        let reading = self
            .chain
            .current_price()
            .await
            .context("Failed to read current price")?;
        if !reading.valid {
            bail!("price source reports an invalid price ({})", reading.price);
        }
        let accumulated_funding = self
            .chain
            .accumulated_funding()
            .await
            .context("Failed to read accumulated funding")?;

        Ok(MarketSnapshot {
            price: reading.price,
            accumulated_funding,
        })
    }

    /// Evaluate one position and liquidate it if needed.
    pub async fn process(
        &self,
        position: &Position,
        market: &MarketSnapshot,
    ) -> Result<LiquidationOutcome> {
        let risk = assess(&RiskInputs::from(position), market)
            .with_context(|| format!("risk evaluation for position {}", position.token_id))?;

        if !risk.liquidatable {
            debug!(
                token_id = %position.token_id,
                remaining = risk.remaining_value_f64(),
                maintenance = risk.maintenance_margin_f64(),
                "Position healthy"
            );
            return Ok(LiquidationOutcome::Healthy);
        }

        log_liquidatable(position, &risk);
        self.liquidate(position.token_id).await
    }

    async fn liquidate(&self, token_id: U256) -> Result<LiquidationOutcome> {
        let gas = self
            .chain
            .gas_params()
            .await
            .context("Failed to read gas price")?;

        if gas.exceeds(self.max_gas_price) {
            warn!(
                token_id = %token_id,
                gas_gwei = gas.effective_gwei(),
                max_gwei = self.max_gas_price as f64 / 1e9,
                "Gas price above ceiling, skipping liquidation this sweep"
            );
            return Ok(LiquidationOutcome::GasTooHigh);
        }

        let start = Instant::now();
        match self.chain.liquidate_position(token_id, &gas).await {
            Ok(receipt) => {
                info!(
                    token_id = %token_id,
                    tx_hash = %receipt.tx_hash,
                    block = receipt.block_number,
                    gas_used = receipt.gas_used,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Position liquidated"
                );

                // The indexer will see the event too; both writes are idempotent
                self.store.mark_inactive(token_id).await?;
                self.audit(LiquidationAttempt::succeeded(token_id, receipt.tx_hash))
                    .await;

                Ok(LiquidationOutcome::Liquidated(receipt))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(
                    token_id = %token_id,
                    error = %message,
                    "Liquidation failed, position stays active"
                );
                self.audit(LiquidationAttempt::failed(token_id, message.clone()))
                    .await;

                Ok(LiquidationOutcome::Failed(message))
            }
        }
    }

    /// Append to the audit trail. A failed write never changes the outcome.
    async fn audit(&self, attempt: LiquidationAttempt) {
        if let Err(e) = self.store.record_liquidation(&attempt).await {
            error!(
                token_id = %attempt.token_id,
                success = attempt.success,
                error = %format!("{:#}", e),
                "Failed to record liquidation attempt"
            );
        }
    }
}

fn log_liquidatable(position: &Position, risk: &RiskAssessment) {
    info!(
        token_id = %position.token_id,
        owner = %position.owner,
        side = position.side(),
        leverage = position.leverage,
        collateral = wad_to_f64(position.collateral),
        pnl = risk.pnl_f64(),
        funding = risk.funding_payment_f64(),
        remaining = risk.remaining_value_f64(),
        maintenance = risk.maintenance_margin_f64(),
        "Position liquidatable"
    );
}
