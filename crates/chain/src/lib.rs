//! Keeper chain interaction layer.
//!
//! This crate provides:
//! - The [`ChainClient`] capability trait and its RPC adapter
//! - Contract bindings for the position manager, price source and position registry
//! - Position event decoding, live subscription and historical range fetch
//! - Transaction signing and sending with a cached nonce
//! - Gas strategy abstraction (Legacy + EIP-1559)

mod client;
pub mod contracts;
mod event_listener;
pub mod gas;
mod provider;
mod signer;

pub use client::{ChainClient, OnChainPosition, PriceReading, TxReceipt};
pub use contracts::event_signatures;
pub use event_listener::{
    parse_position_event, EventListener, EventMeta, EventStream, PositionEvent,
    PositionEventSource,
};
pub use gas::{GasParams, GasStrategy};
pub use provider::{ContractAddresses, RpcChainClient};
pub use signer::{NonceManager, TransactionSender};
