//! Scheduled funding rate updates.
//!
//! Submits `updateFundingRate()` on a fixed interval. Submissions are
//! rate-limited by a cool-down clock, gas breaches and failures get one
//! delayed retry each.

use keeper_chain::ChainClient;
use keeper_store::{FundingUpdateRecord, PositionStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::fixed_math::funding_rate_pct;
use crate::shutdown::Shutdown;

/// Minimum spacing between two submissions.
pub const FUNDING_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingOutcome {
    Updated(FundingUpdateRecord),
    /// Inside the cool-down window
    Skipped,
    /// Gas above the ceiling
    Deferred,
    Failed(String),
}

impl FundingOutcome {
    fn wants_retry(&self) -> bool {
        matches!(self, Self::Deferred | Self::Failed(_))
    }
}

pub struct FundingUpdater {
    chain: Arc<dyn ChainClient>,
    store: PositionStore,
    interval: Duration,
    retry_delay: Duration,
    /// Gas ceiling in wei
    max_gas_price: u128,
    cooldown: Duration,
    last_submission: Mutex<Option<Instant>>,
    shutdown: Shutdown,
}

impl FundingUpdater {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: PositionStore,
        interval: Duration,
        retry_delay: Duration,
        max_gas_price: u128,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain,
            store,
            interval,
            retry_delay,
            max_gas_price,
            cooldown: FUNDING_COOLDOWN,
            last_submission: Mutex::new(None),
            shutdown,
        }
    }

    /// Override the cool-down window.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Update immediately, then every `interval` until shutdown.
    pub async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            retry_ms = self.retry_delay.as_millis() as u64,
            "Funding updater starting"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if !self.update().await.wants_retry() {
                continue;
            }

            info!(
                retry_ms = self.retry_delay.as_millis() as u64,
                "Scheduling funding update retry"
            );
            if self.shutdown.sleep(self.retry_delay).await {
                break;
            }
            if self.update().await.wants_retry() {
                warn!("Funding update retry unsuccessful, waiting for next interval");
            }
        }

        info!("Funding updater stopped");
    }

    fn in_cooldown(last: Option<Instant>, cooldown: Duration) -> bool {
        last.is_some_and(|at| at.elapsed() < cooldown)
    }

    /// One guarded update attempt.
    #[instrument(skip(self), name = "funding_update")]
    pub async fn update(&self) -> FundingOutcome {
        if Self::in_cooldown(*self.last_submission.lock(), self.cooldown) {
            info!("Funding update inside cool-down, skipping");
            return FundingOutcome::Skipped;
        }

        let gas = match self.chain.gas_params().await {
            Ok(gas) => gas,
            Err(e) => {
                warn!(error = %e, "Failed to read gas price for funding update");
                return FundingOutcome::Failed(format!("{:#}", e));
            }
        };
        if gas.exceeds(self.max_gas_price) {
            warn!(
                gas_gwei = gas.effective_gwei(),
                max_gwei = self.max_gas_price as f64 / 1e9,
                "Gas price above ceiling, deferring funding update"
            );
            return FundingOutcome::Deferred;
        }

        // Check and stamp together so overlapping callers submit once
        {
            let mut last = self.last_submission.lock();
            if Self::in_cooldown(*last, self.cooldown) {
                info!("Funding update inside cool-down, skipping");
                return FundingOutcome::Skipped;
            }
            *last = Some(Instant::now());
        }

        let receipt = match self.chain.update_funding_rate(&gas).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let message = format!("{:#}", e);
                error!(error = %message, "Funding rate update failed");
                return FundingOutcome::Failed(message);
            }
        };

        let resulting_rate = match self.chain.current_funding_rate().await {
            Ok(rate) => {
                info!(
                    tx_hash = %receipt.tx_hash,
                    block = receipt.block_number,
                    gas_used = receipt.gas_used,
                    rate = %rate,
                    rate_pct = funding_rate_pct(rate),
                    "Funding rate updated"
                );
                Some(rate)
            }
            Err(e) => {
                warn!(
                    tx_hash = %receipt.tx_hash,
                    error = %e,
                    "Funding rate updated, but reading the new rate failed"
                );
                None
            }
        };

        let timestamp = match self.chain.block_timestamp(receipt.block_number).await {
            Ok(ts) => ts as i64,
            Err(e) => {
                warn!(block = receipt.block_number, error = %e, "Block timestamp unavailable, using local clock");
                chrono::Utc::now().timestamp()
            }
        };
        let record = FundingUpdateRecord {
            block_number: receipt.block_number,
            timestamp,
            resulting_rate,
            tx_hash: receipt.tx_hash,
        };
        if let Err(e) = self.store.record_funding_update(&record).await {
            error!(tx_hash = %record.tx_hash, error = %e, "Failed to persist funding update");
        }

        FundingOutcome::Updated(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gwei, MockChain};
    use alloy::primitives::I256;

    const MAX_GAS: u128 = 50_000_000_000;

    async fn setup(
        chain: Arc<MockChain>,
        retry_delay: Duration,
    ) -> (FundingUpdater, PositionStore, Shutdown) {
        let store = PositionStore::in_memory().await.unwrap();
        let shutdown = Shutdown::new();
        let updater = FundingUpdater::new(
            chain,
            store.clone(),
            Duration::from_secs(3600),
            retry_delay,
            MAX_GAS,
            shutdown.clone(),
        );
        (updater, store, shutdown)
    }

    #[tokio::test]
    async fn test_update_records_resulting_rate() {
        let chain = Arc::new(MockChain::new());
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        let outcome = updater.update().await;

        let FundingOutcome::Updated(record) = outcome.clone() else {
            panic!("expected update, got {:?}", outcome);
        };
        assert_eq!(record.resulting_rate, Some(I256::try_from(25i64).unwrap()));
        assert_eq!(record.block_number, 100);
        assert_eq!(chain.funding_updates(), 1);
        assert_eq!(store.funding_updates().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_record_uses_block_timestamp() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.head = 250);
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        let outcome = updater.update().await;

        let FundingOutcome::Updated(record) = outcome.clone() else {
            panic!("expected update, got {:?}", outcome);
        };
        assert_eq!(record.block_number, 250);
        assert_eq!(record.timestamp, 1_700_000_250);
        assert_eq!(store.funding_updates().await.unwrap()[0].timestamp, 1_700_000_250);
    }

    #[tokio::test]
    async fn test_block_timestamp_failure_falls_back_to_clock() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.block_timestamp_error = true);
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;
        let before = chrono::Utc::now().timestamp();

        let outcome = updater.update().await;

        let FundingOutcome::Updated(record) = outcome.clone() else {
            panic!("expected update, got {:?}", outcome);
        };
        assert!(record.timestamp >= before);
        assert_eq!(store.funding_updates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_calls_within_cooldown_submit_once() {
        let chain = Arc::new(MockChain::new());
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        assert!(matches!(updater.update().await, FundingOutcome::Updated(_)));
        assert_eq!(updater.update().await, FundingOutcome::Skipped);

        assert_eq!(chain.funding_updates(), 1);
        assert_eq!(store.funding_updates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_submit_once() {
        let chain = Arc::new(MockChain::new());
        let (updater, _, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        let (a, b) = tokio::join!(updater.update(), updater.update());

        let updated = [&a, &b]
            .iter()
            .filter(|o| matches!(o, FundingOutcome::Updated(_)))
            .count();
        assert_eq!(updated, 1);
        assert_eq!(chain.funding_updates(), 1);
    }

    #[tokio::test]
    async fn test_update_allowed_after_cooldown() {
        let chain = Arc::new(MockChain::new());
        let (updater, _, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        assert!(matches!(updater.update().await, FundingOutcome::Updated(_)));
        *updater.last_submission.lock() =
            Instant::now().checked_sub(FUNDING_COOLDOWN + Duration::from_secs(1));
        assert!(matches!(updater.update().await, FundingOutcome::Updated(_)));

        assert_eq!(chain.funding_updates(), 2);
    }

    #[tokio::test]
    async fn test_gas_breach_defers_without_stamping() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.gas = gwei(80));
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        assert_eq!(updater.update().await, FundingOutcome::Deferred);
        assert_eq!(chain.funding_updates(), 0);
        assert!(store.funding_updates().await.unwrap().is_empty());

        // A deferral is not a submission, so the cool-down does not apply
        chain.with(|s| s.gas = gwei(10));
        assert!(matches!(updater.update().await, FundingOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn test_failed_readback_still_recorded() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.funding_rate_error = true);
        let (updater, store, _) = setup(chain.clone(), Duration::from_secs(300)).await;

        assert!(matches!(updater.update().await, FundingOutcome::Updated(_)));

        let records = store.funding_updates().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resulting_rate, None);
    }

    #[tokio::test]
    async fn test_failure_is_retried_once() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.fail_funding_updates = 1);
        let (updater, store, shutdown) = setup(chain.clone(), Duration::from_millis(20)).await;
        let updater = updater.with_cooldown(Duration::ZERO);

        let handle = tokio::spawn(async move { updater.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert_eq!(chain.funding_updates(), 1);
        assert_eq!(store.funding_updates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_does_not_chain() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.fail_funding_updates = 3);
        let (updater, _, shutdown) = setup(chain.clone(), Duration::from_millis(20)).await;
        let updater = updater.with_cooldown(Duration::ZERO);

        let handle = tokio::spawn(async move { updater.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();
        handle.await.unwrap();

        // First tick and its single retry; the next tick is an hour away
        let mut remaining = 0;
        chain.with(|s| remaining = s.fail_funding_updates);
        assert_eq!(remaining, 1);
        assert_eq!(chain.funding_updates(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_wait() {
        let chain = Arc::new(MockChain::new());
        chain.with(|s| s.gas = gwei(80));
        let (updater, _, shutdown) = setup(chain.clone(), Duration::from_secs(3600)).await;

        let handle = tokio::spawn(async move { updater.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chain.funding_updates(), 0);
    }
}
