//! In-crate fakes for the chain and the event source.

use alloy::primitives::{Address, B256, I256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use keeper_chain::{
    ChainClient, EventMeta, EventStream, GasParams, OnChainPosition, PositionEvent,
    PositionEventSource, PriceReading, TxReceipt,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::fixed_math::WAD;

pub fn wad(units: u64) -> U256 {
    U256::from(units) * WAD
}

pub fn gwei(value: u128) -> GasParams {
    GasParams::Legacy {
        gas_price: value * 1_000_000_000,
    }
}

/// Mutable chain state behind [`MockChain`].
pub struct MockState {
    pub head: u64,
    pub block_timestamp_error: bool,
    pub price: PriceReading,
    pub price_error: bool,
    pub accumulated_funding: I256,
    pub funding_rate: I256,
    pub funding_rate_error: bool,
    pub gas: GasParams,
    pub positions: HashMap<U256, OnChainPosition>,
    pub fail_liquidations: HashSet<U256>,
    /// Number of upcoming `updateFundingRate` calls that revert
    pub fail_funding_updates: usize,
    pub liquidations: Vec<U256>,
    pub funding_updates: usize,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                head: 100,
                block_timestamp_error: false,
                price: PriceReading {
                    price: wad(100),
                    valid: true,
                },
                price_error: false,
                accumulated_funding: I256::ZERO,
                funding_rate: I256::try_from(25i64).unwrap(),
                funding_rate_error: false,
                gas: gwei(10),
                positions: HashMap::new(),
                fail_liquidations: HashSet::new(),
                fail_funding_updates: 0,
                liquidations: Vec::new(),
                funding_updates: 0,
            }),
        }
    }

    pub fn with(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock());
    }

    pub fn liquidations(&self) -> Vec<U256> {
        self.state.lock().liquidations.clone()
    }

    pub fn funding_updates(&self) -> usize {
        self.state.lock().funding_updates
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.state.lock().head)
    }

    /// Block `n` is stamped `1_700_000_000 + n`, matching [`meta`].
    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        if self.state.lock().block_timestamp_error {
            return Err(anyhow!("eth_getBlockByNumber: connection refused"));
        }
        Ok(1_700_000_000 + block)
    }

    async fn current_price(&self) -> Result<PriceReading> {
        let state = self.state.lock();
        if state.price_error {
            return Err(anyhow!("getCurrentPrice: connection refused"));
        }
        Ok(state.price)
    }

    async fn accumulated_funding(&self) -> Result<I256> {
        Ok(self.state.lock().accumulated_funding)
    }

    async fn current_funding_rate(&self) -> Result<I256> {
        let state = self.state.lock();
        if state.funding_rate_error {
            return Err(anyhow!("getCurrentFundingRate: connection refused"));
        }
        Ok(state.funding_rate)
    }

    async fn position_data(&self, token_id: U256) -> Result<OnChainPosition> {
        self.state
            .lock()
            .positions
            .get(&token_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown token {}", token_id))
    }

    async fn gas_params(&self) -> Result<GasParams> {
        Ok(self.state.lock().gas.clone())
    }

    async fn liquidate_position(&self, token_id: U256, _gas: &GasParams) -> Result<TxReceipt> {
        let mut state = self.state.lock();
        if state.fail_liquidations.contains(&token_id) {
            return Err(anyhow!("execution reverted: position healthy"));
        }
        state.liquidations.push(token_id);
        Ok(TxReceipt {
            tx_hash: B256::from(token_id.to_be_bytes::<32>()),
            block_number: state.head,
            gas_used: 120_000,
        })
    }

    async fn update_funding_rate(&self, _gas: &GasParams) -> Result<TxReceipt> {
        let mut state = self.state.lock();
        if state.fail_funding_updates > 0 {
            state.fail_funding_updates -= 1;
            return Err(anyhow!("execution reverted: too early"));
        }
        state.funding_updates += 1;
        Ok(TxReceipt {
            tx_hash: B256::repeat_byte(state.funding_updates as u8),
            block_number: state.head,
            gas_used: 80_000,
        })
    }
}

/// Scripted event source.
pub struct MockEvents {
    history: Mutex<Vec<PositionEvent>>,
    live: Mutex<Vec<PositionEvent>>,
    /// Keep the live stream open after the scripted events
    keep_open: bool,
    supports_live: bool,
    /// Number of upcoming `fetch_events` calls that fail
    fail_fetches: Mutex<usize>,
    fetched: Mutex<Vec<(u64, u64)>>,
    /// "subscribe" / "fetch" in call order
    calls: Mutex<Vec<&'static str>>,
}

impl MockEvents {
    pub fn new(history: Vec<PositionEvent>) -> Self {
        Self {
            history: Mutex::new(history),
            live: Mutex::new(Vec::new()),
            keep_open: true,
            supports_live: true,
            fail_fetches: Mutex::new(0),
            fetched: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_live(mut self, events: Vec<PositionEvent>, keep_open: bool) -> Self {
        self.live = Mutex::new(events);
        self.keep_open = keep_open;
        self
    }

    pub fn without_live(mut self) -> Self {
        self.supports_live = false;
        self
    }

    pub fn fail_next_fetches(&self, n: usize) {
        *self.fail_fetches.lock() = n;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn fetched_ranges(&self) -> Vec<(u64, u64)> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl PositionEventSource for MockEvents {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<PositionEvent>> {
        self.calls.lock().push("fetch");
        {
            let mut fail = self.fail_fetches.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(anyhow!("eth_getLogs: timeout"));
            }
        }
        self.fetched.lock().push((from_block, to_block));

        let mut events: Vec<PositionEvent> = self
            .history
            .lock()
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number()))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.meta().block_number, e.meta().log_index));
        Ok(events)
    }

    async fn subscribe(&self) -> Result<EventStream> {
        self.calls.lock().push("subscribe");
        if !self.supports_live {
            return Err(anyhow!("No WebSocket URL configured"));
        }
        let events = std::mem::take(&mut *self.live.lock());
        let scripted = stream::iter(events);
        if self.keep_open {
            Ok(scripted.chain(stream::pending()).boxed())
        } else {
            Ok(scripted.boxed())
        }
    }

    fn supports_live(&self) -> bool {
        self.supports_live
    }
}

pub fn meta(block: u64, index: u64) -> EventMeta {
    EventMeta {
        block_number: block,
        log_index: index,
        tx_hash: B256::repeat_byte(0xee),
        block_timestamp: Some(1_700_000_000 + block),
    }
}

/// 1000 collateral, 10x long at `entry_price` (or without one).
pub fn opened(token: u64, block: u64, entry_price: Option<U256>) -> PositionEvent {
    PositionEvent::Opened {
        token_id: U256::from(token),
        owner: Address::repeat_byte(0x01),
        collateral: wad(1000),
        leverage: U256::from(10u64),
        entry_price,
        entry_funding_rate: I256::ZERO,
        is_long: true,
        meta: meta(block, 0),
    }
}

pub fn closed(token: u64, block: u64) -> PositionEvent {
    PositionEvent::Closed {
        token_id: U256::from(token),
        owner: Address::repeat_byte(0x01),
        pnl: I256::ZERO,
        funding_payment: I256::ZERO,
        fees: U256::ZERO,
        meta: meta(block, 1),
    }
}

pub fn liquidated(token: u64, block: u64) -> PositionEvent {
    PositionEvent::Liquidated {
        token_id: U256::from(token),
        owner: Address::repeat_byte(0x01),
        meta: meta(block, 2),
    }
}
