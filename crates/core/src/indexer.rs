//! Position indexer.
//!
//! Mirrors the position manager's lifecycle events into the store:
//! - **Live-only**: subscribe from the current head, no replay
//! - **Backfill-then-live**: subscribe, replay `[checkpoint + 1, head]` in
//!   bounded batches while buffering live events, then apply the buffer and
//!   follow the stream. The checkpoint only advances past fully applied
//!   blocks.
//!
//! Every handler is idempotent (upsert / mark-inactive), so replaying a
//! range after a crash or a failed batch leaves the store unchanged, and a
//! block seen both by the backfill and the subscription is harmless.
//! Losing the live stream is fatal: the supervisor restarts the process.

use alloy::primitives::U256;
use anyhow::{Context, Result};
use futures::StreamExt;
use keeper_chain::{ChainClient, EventStream, PositionEvent, PositionEventSource};
use keeper_store::{Position, PositionStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::IndexerMode;
use crate::shutdown::Shutdown;

/// Fatal indexer failure.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("live event subscription failed: {0:#}")]
    Subscribe(anyhow::Error),
    #[error("live event stream ended unexpectedly")]
    StreamEnded,
    #[error("live event at block {block} could not be applied: {reason}")]
    LiveEvent { block: u64, reason: String },
    #[error("indexer task aborted: {0}")]
    Aborted(String),
}

/// Indexer tuning.
#[derive(Debug, Clone, Copy)]
pub struct IndexerSettings {
    pub mode: IndexerMode,
    /// Blocks per `eth_getLogs` batch
    pub batch_size: u64,
    /// Backoff before retrying a failed batch
    pub retry_delay: Duration,
}

pub struct Indexer {
    chain: Arc<dyn ChainClient>,
    events: Arc<dyn PositionEventSource>,
    store: PositionStore,
    settings: IndexerSettings,
    shutdown: Shutdown,
}

impl Indexer {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        events: Arc<dyn PositionEventSource>,
        store: PositionStore,
        settings: IndexerSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chain,
            events,
            store,
            settings,
            shutdown,
        }
    }

    /// Run until shutdown.
    ///
    /// Returns an error when the live stream is lost, or in backfill mode
    /// when a live event cannot be applied.
    pub async fn run(&self) -> Result<(), IndexerError> {
        info!(
            mode = %self.settings.mode,
            batch_size = self.settings.batch_size,
            "Indexer starting"
        );

        // Subscribe before backfilling so blocks mined in between reach us
        let mut stream = if self.events.supports_live() {
            Some(self.open_stream().await?)
        } else {
            warn!("RPC_WS_URL not set, live position events disabled");
            None
        };

        if self.settings.mode == IndexerMode::BackfillThenLive {
            let mut pending = Vec::new();
            let caught_up = match stream.as_mut() {
                Some(stream) => self.backfill_buffering(stream, &mut pending).await?,
                None => self.backfill().await,
            };
            if !caught_up {
                info!("Indexer stopped during backfill");
                return Ok(());
            }

            if !pending.is_empty() {
                debug!(events = pending.len(), "Applying events buffered during backfill");
            }
            for event in &pending {
                self.handle_live_event(event).await?;
            }
        }

        match stream {
            Some(stream) => self.live(stream).await,
            None => {
                self.shutdown.wait().await;
                Ok(())
            }
        }
    }

    async fn open_stream(&self) -> Result<EventStream, IndexerError> {
        match self.chain.block_number().await {
            Ok(head) => info!(from_block = head + 1, "Listening for live position events"),
            Err(e) => warn!(error = %e, "Failed to read head block before subscribing"),
        }

        self.events
            .subscribe()
            .await
            .map_err(IndexerError::Subscribe)
    }

    /// Backfill while holding live events in `pending`.
    async fn backfill_buffering(
        &self,
        stream: &mut EventStream,
        pending: &mut Vec<PositionEvent>,
    ) -> Result<bool, IndexerError> {
        let backfill = self.backfill();
        tokio::pin!(backfill);

        loop {
            tokio::select! {
                caught_up = &mut backfill => return Ok(caught_up),
                next = stream.next() => match next {
                    Some(event) => pending.push(event),
                    None => {
                        if self.shutdown.is_triggered() {
                            return Ok(false);
                        }
                        error!("Live position event stream ended during backfill");
                        return Err(IndexerError::StreamEnded);
                    }
                },
            }
        }
    }

    /// Replay history up to the current head.
    ///
    /// Returns `false` if shutdown was requested before catching up.
    pub async fn backfill(&self) -> bool {
        let Some(mut next) = self.starting_block().await else {
            return false;
        };

        loop {
            if self.shutdown.is_triggered() {
                return false;
            }

            // Re-read every round so blocks mined during backfill are replayed too
            let head = match self.chain.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(error = %e, "Failed to read head block during backfill");
                    if self.shutdown.sleep(self.settings.retry_delay).await {
                        return false;
                    }
                    continue;
                }
            };

            if next > head {
                info!(checkpoint = next - 1, head = head, "Backfill caught up");
                return true;
            }

            let end = next
                .saturating_add(self.settings.batch_size.saturating_sub(1))
                .min(head);

            match self.process_batch(next, end).await {
                Ok(count) => {
                    debug!(from = next, to = end, events = count, "Backfill batch done");
                    next = end + 1;
                }
                Err(e) => {
                    warn!(
                        from = next,
                        to = end,
                        error = %format!("{:#}", e),
                        retry_ms = self.settings.retry_delay.as_millis() as u64,
                        "Backfill batch failed, retrying same range"
                    );
                    if self.shutdown.sleep(self.settings.retry_delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// First block to replay. An unset checkpoint is initialized to the
    /// current head, so nothing is replayed.
    async fn starting_block(&self) -> Option<u64> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }

            match self.resolve_start().await {
                Ok(start) => return Some(start),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to read indexer checkpoint");
                    if self.shutdown.sleep(self.settings.retry_delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn resolve_start(&self) -> Result<u64> {
        let checkpoint = self.store.checkpoint().await?;
        if checkpoint.last_processed_block > 0 {
            info!(
                checkpoint = checkpoint.last_processed_block,
                "Resuming backfill from checkpoint"
            );
            return Ok(checkpoint.last_processed_block + 1);
        }

        let head = self.chain.block_number().await?;
        self.store.advance_checkpoint(head).await?;
        info!(head = head, "No checkpoint, starting from current head");
        Ok(head + 1)
    }

    /// Fetch and apply one block range, then advance the checkpoint.
    #[instrument(skip(self), level = "debug")]
    pub async fn process_batch(&self, from_block: u64, to_block: u64) -> Result<usize> {
        let events = self.events.fetch_events(from_block, to_block).await?;
        for event in &events {
            self.handle_event(event).await?;
        }
        self.store.advance_checkpoint(to_block).await?;
        Ok(events.len())
    }

    async fn live(&self, mut stream: EventStream) -> Result<(), IndexerError> {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    info!("Indexer stopping");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(event) => self.handle_live_event(&event).await?,
                    None => {
                        if self.shutdown.is_triggered() {
                            return Ok(());
                        }
                        error!("Live position event stream ended");
                        return Err(IndexerError::StreamEnded);
                    }
                },
            }
        }
    }

    /// Apply a live event.
    ///
    /// In backfill mode a failure is fatal: the checkpoint stays before the
    /// event's block so the restart replays it. Live-only mode has nothing
    /// to replay from and keeps going.
    async fn handle_live_event(&self, event: &PositionEvent) -> Result<(), IndexerError> {
        if let Err(e) = self.handle_event(event).await {
            error!(
                event = event.event_type(),
                token_id = %event.token_id(),
                block = event.block_number(),
                error = %format!("{:#}", e),
                "Failed to handle live event"
            );
            if self.settings.mode == IndexerMode::BackfillThenLive {
                return Err(IndexerError::LiveEvent {
                    block: event.block_number(),
                    reason: format!("{:#}", e),
                });
            }
            return Ok(());
        }

        if self.settings.mode == IndexerMode::BackfillThenLive {
            if let Err(e) = self.store.advance_checkpoint(event.block_number()).await {
                warn!(error = %e, "Failed to advance checkpoint from live event");
            }
        }
        Ok(())
    }

    /// Apply one event to the store.
    pub async fn handle_event(&self, event: &PositionEvent) -> Result<()> {
        match event {
            PositionEvent::Opened {
                token_id,
                owner,
                collateral,
                leverage,
                entry_price,
                entry_funding_rate,
                is_long,
                meta,
            } => {
                let entry_price = match entry_price {
                    Some(price) => *price,
                    None => self.backfill_entry_price(*token_id).await?,
                };
                let leverage = leverage_to_u64(*leverage)
                    .with_context(|| format!("position {} has unsupported leverage", token_id))?;
                let timestamp = meta
                    .block_timestamp
                    .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64);

                let position = Position::opened(
                    *token_id,
                    *owner,
                    *collateral,
                    leverage,
                    entry_price,
                    *entry_funding_rate,
                    *is_long,
                    meta.block_number,
                    timestamp,
                );
                self.store.upsert_position(&position).await?;

                info!(
                    token_id = %token_id,
                    owner = %owner,
                    side = position.side(),
                    leverage = leverage,
                    block = meta.block_number,
                    "Position opened"
                );
            }
            PositionEvent::Closed { token_id, meta, .. }
            | PositionEvent::Liquidated { token_id, meta, .. } => {
                let updated = self.store.mark_inactive(*token_id).await?;
                if updated {
                    info!(
                        token_id = %token_id,
                        event = event.event_type(),
                        block = meta.block_number,
                        "Position deactivated"
                    );
                } else {
                    debug!(
                        token_id = %token_id,
                        event = event.event_type(),
                        "Deactivation for unknown position"
                    );
                }
            }
        }
        Ok(())
    }

    async fn backfill_entry_price(&self, token_id: U256) -> Result<U256> {
        let data = self
            .chain
            .position_data(token_id)
            .await
            .with_context(|| format!("entry price lookup for position {}", token_id))?;
        if data.entry_price.is_zero() {
            anyhow::bail!("position {} has no entry price on chain", token_id);
        }
        debug!(token_id = %token_id, entry_price = %data.entry_price, "Entry price read from registry");
        Ok(data.entry_price)
    }
}

fn leverage_to_u64(leverage: U256) -> Result<u64> {
    if leverage > U256::from(u64::MAX) {
        anyhow::bail!("leverage {} exceeds u64", leverage);
    }
    Ok(leverage.to::<u64>())
}
