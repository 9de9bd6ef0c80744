//! Position lifecycle events: live WebSocket subscription and historical
//! range fetch over HTTP.

use alloy::primitives::{Address, B256, I256, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::{ConnectionHandle, PubSubConnect};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{TransportErrorKind, TransportResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use tracing::{debug, info, warn};

use crate::contracts::compact::ICompactPositionEvents;
use crate::contracts::{event_signatures, IPositionManager};

/// Where a decoded event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMeta {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
    /// Block timestamp (seconds) when the node includes it in the log
    pub block_timestamp: Option<u64>,
}

/// Position lifecycle event emitted by the position manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionEvent {
    Opened {
        token_id: U256,
        owner: Address,
        collateral: U256,
        leverage: U256,
        /// `None` when the emitting deployment omits it
        entry_price: Option<U256>,
        entry_funding_rate: I256,
        is_long: bool,
        meta: EventMeta,
    },
    Closed {
        token_id: U256,
        owner: Address,
        pnl: I256,
        funding_payment: I256,
        fees: U256,
        meta: EventMeta,
    },
    Liquidated {
        token_id: U256,
        owner: Address,
        meta: EventMeta,
    },
}

impl PositionEvent {
    /// Token the event refers to.
    pub fn token_id(&self) -> U256 {
        match self {
            Self::Opened { token_id, .. }
            | Self::Closed { token_id, .. }
            | Self::Liquidated { token_id, .. } => *token_id,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Opened { meta, .. } | Self::Closed { meta, .. } | Self::Liquidated { meta, .. } => {
                meta
            }
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "PositionOpened",
            Self::Closed { .. } => "PositionClosed",
            Self::Liquidated { .. } => "PositionLiquidated",
        }
    }

    /// Get the block number.
    pub fn block_number(&self) -> u64 {
        self.meta().block_number
    }
}

/// Live event stream. Ends when the underlying connection is lost.
pub type EventStream = Pin<Box<dyn Stream<Item = PositionEvent> + Send>>;

/// Source of position lifecycle events.
#[async_trait]
pub trait PositionEventSource: Send + Sync {
    /// Events in `[from_block, to_block]`, ordered by (block, log index).
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<PositionEvent>>;

    /// Subscribe to new events as they are mined.
    async fn subscribe(&self) -> Result<EventStream>;

    /// False when no live transport is configured.
    fn supports_live(&self) -> bool;
}

/// WebSocket connector that refuses to reconnect.
///
/// A silent resubscribe would skip every log emitted while the socket was
/// down, so a dropped connection must end the stream instead.
#[derive(Debug, Clone)]
struct SingleConnection(WsConnect);

impl PubSubConnect for SingleConnection {
    fn is_local(&self) -> bool {
        self.0.is_local()
    }

    async fn connect(&self) -> TransportResult<ConnectionHandle> {
        self.0.connect().await
    }

    async fn try_reconnect(&self) -> TransportResult<ConnectionHandle> {
        Err(TransportErrorKind::custom_str("event subscription connection lost"))
    }
}

/// Position manager event listener.
pub struct EventListener {
    /// HTTP URL for `eth_getLogs`
    http_url: String,
    /// WebSocket URL for subscriptions
    ws_url: Option<String>,
    /// Position manager contract address
    position_manager: Address,
}

impl EventListener {
    /// Create a new event listener.
    pub fn new(
        http_url: impl Into<String>,
        ws_url: Option<String>,
        position_manager: Address,
    ) -> Self {
        Self {
            http_url: http_url.into(),
            ws_url: ws_url.filter(|url| !url.trim().is_empty()),
            position_manager,
        }
    }

    fn filter(&self) -> Filter {
        Filter::new()
            .address(self.position_manager)
            .event_signature(event_signatures::position_signatures())
    }
}

#[async_trait]
impl PositionEventSource for EventListener {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<PositionEvent>> {
        let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
        let filter = self.filter().from_block(from_block).to_block(to_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .with_context(|| format!("eth_getLogs failed for blocks {}..={}", from_block, to_block))?;

        let mut events: Vec<PositionEvent> = logs.into_iter().filter_map(parse_position_event).collect();
        events.sort_by_key(|e| (e.meta().block_number, e.meta().log_index));

        debug!(
            from = from_block,
            to = to_block,
            count = events.len(),
            "Fetched historical position events"
        );
        Ok(events)
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let ws_url = self
            .ws_url
            .as_deref()
            .context("No WebSocket URL configured")?;

        info!(
            position_manager = %self.position_manager,
            ws_url = %ws_url,
            "Subscribing to position events"
        );

        let client = ClientBuilder::default()
            .pubsub(SingleConnection(WsConnect::new(ws_url)))
            .await
            .context("WebSocket connect failed")?;
        let provider = ProviderBuilder::new().on_client(client);
        info!("WebSocket connected for position events");

        let sub = provider.subscribe_logs(&self.filter()).await?;
        let inner_stream = sub.into_stream();

        // Provider lives in the stream state; dropping it closes the socket
        let event_stream = futures::stream::unfold(
            (provider, inner_stream),
            |(provider, mut stream)| async move {
                loop {
                    match stream.next().await {
                        Some(log) => {
                            if let Some(event) = parse_position_event(log) {
                                return Some((event, (provider, stream)));
                            }
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(event_stream))
    }

    fn supports_live(&self) -> bool {
        self.ws_url.is_some()
    }
}

/// Decode a position manager log.
///
/// Returns `None` for removed (reorged) logs, unknown topics and logs that
/// fail ABI decoding.
pub fn parse_position_event(log: Log) -> Option<PositionEvent> {
    if log.removed {
        debug!(tx_hash = ?log.transaction_hash, "Skipping removed log");
        return None;
    }

    let sig = *log.topics().first()?;
    let meta = EventMeta {
        block_number: log.block_number.unwrap_or(0),
        log_index: log.log_index.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        block_timestamp: log.block_timestamp,
    };

    let parsed = if sig == event_signatures::POSITION_OPENED {
        log.log_decode::<IPositionManager::PositionOpened>()
            .map(|decoded| {
                let e = decoded.inner.data;
                PositionEvent::Opened {
                    token_id: e.tokenId,
                    owner: e.owner,
                    collateral: e.collateral,
                    leverage: e.leverage,
                    entry_price: (!e.entryPrice.is_zero()).then_some(e.entryPrice),
                    entry_funding_rate: e.entryFundingRate,
                    is_long: e.isLong,
                    meta,
                }
            })
    } else if sig == event_signatures::POSITION_OPENED_COMPACT {
        log.log_decode::<ICompactPositionEvents::PositionOpened>()
            .map(|decoded| {
                let e = decoded.inner.data;
                PositionEvent::Opened {
                    token_id: e.tokenId,
                    owner: e.owner,
                    collateral: e.collateral,
                    leverage: e.leverage,
                    entry_price: None,
                    entry_funding_rate: e.entryFundingRate,
                    is_long: e.isLong,
                    meta,
                }
            })
    } else if sig == event_signatures::POSITION_CLOSED {
        log.log_decode::<IPositionManager::PositionClosed>()
            .map(|decoded| {
                let e = decoded.inner.data;
                PositionEvent::Closed {
                    token_id: e.tokenId,
                    owner: e.owner,
                    pnl: e.pnl,
                    funding_payment: e.fundingPayment,
                    fees: e.fees,
                    meta,
                }
            })
    } else if sig == event_signatures::POSITION_LIQUIDATED {
        log.log_decode::<IPositionManager::PositionLiquidated>()
            .map(|decoded| {
                let e = decoded.inner.data;
                PositionEvent::Liquidated {
                    token_id: e.tokenId,
                    owner: e.owner,
                    meta,
                }
            })
    } else {
        debug!(topic = %sig, "Ignoring log with unknown topic");
        return None;
    };

    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(
                topic = %sig,
                block = meta.block_number,
                tx_hash = %meta.tx_hash,
                error = %e,
                "Failed to decode position event"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};
    use alloy::sol_types::SolEvent;
    use futures::SinkExt;

    fn rpc_log(data: LogData, block: u64, index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xaa),
                data,
            },
            block_number: Some(block),
            log_index: Some(index),
            transaction_hash: Some(B256::repeat_byte(0x11)),
            block_timestamp: Some(1_700_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_position_opened() {
        let event = IPositionManager::PositionOpened {
            tokenId: U256::from(7u64),
            owner: Address::repeat_byte(1),
            collateral: U256::from(1_000u64),
            leverage: U256::from(5u64),
            entryPrice: U256::from(100u64),
            entryFundingRate: I256::try_from(-3i64).unwrap(),
            isLong: true,
        };

        let parsed = parse_position_event(rpc_log(event.encode_log_data(), 10, 2)).unwrap();
        match parsed {
            PositionEvent::Opened {
                token_id,
                entry_price,
                entry_funding_rate,
                is_long,
                meta,
                ..
            } => {
                assert_eq!(token_id, U256::from(7u64));
                assert_eq!(entry_price, Some(U256::from(100u64)));
                assert_eq!(entry_funding_rate, I256::try_from(-3i64).unwrap());
                assert!(is_long);
                assert_eq!(meta.block_number, 10);
                assert_eq!(meta.log_index, 2);
                assert_eq!(meta.block_timestamp, Some(1_700_000_000));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_zero_entry_price_is_treated_as_missing() {
        let event = IPositionManager::PositionOpened {
            tokenId: U256::from(8u64),
            owner: Address::repeat_byte(1),
            collateral: U256::from(1_000u64),
            leverage: U256::from(2u64),
            entryPrice: U256::ZERO,
            entryFundingRate: I256::ZERO,
            isLong: false,
        };

        let parsed = parse_position_event(rpc_log(event.encode_log_data(), 1, 0)).unwrap();
        assert!(matches!(parsed, PositionEvent::Opened { entry_price: None, .. }));
    }

    #[test]
    fn test_parse_compact_position_opened() {
        let event = ICompactPositionEvents::PositionOpened {
            tokenId: U256::from(9u64),
            owner: Address::repeat_byte(2),
            collateral: U256::from(500u64),
            leverage: U256::from(3u64),
            entryFundingRate: I256::ZERO,
            isLong: false,
        };

        let parsed = parse_position_event(rpc_log(event.encode_log_data(), 5, 0)).unwrap();
        match parsed {
            PositionEvent::Opened {
                token_id,
                entry_price,
                leverage,
                ..
            } => {
                assert_eq!(token_id, U256::from(9u64));
                assert_eq!(entry_price, None);
                assert_eq!(leverage, U256::from(3u64));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_closed_and_liquidated() {
        let closed = IPositionManager::PositionClosed {
            tokenId: U256::from(1u64),
            owner: Address::repeat_byte(3),
            pnl: I256::try_from(-50i64).unwrap(),
            fundingPayment: I256::ZERO,
            fees: U256::from(2u64),
        };
        let parsed = parse_position_event(rpc_log(closed.encode_log_data(), 3, 1)).unwrap();
        assert_eq!(parsed.event_type(), "PositionClosed");
        assert_eq!(parsed.token_id(), U256::from(1u64));

        let liquidated = IPositionManager::PositionLiquidated {
            tokenId: U256::from(2u64),
            owner: Address::repeat_byte(3),
        };
        let parsed = parse_position_event(rpc_log(liquidated.encode_log_data(), 4, 0)).unwrap();
        assert_eq!(parsed.event_type(), "PositionLiquidated");
        assert_eq!(parsed.block_number(), 4);
    }

    #[test]
    fn test_unknown_and_malformed_logs_are_skipped() {
        let unknown = LogData::new_unchecked(vec![B256::repeat_byte(0x42)], Bytes::new());
        assert!(parse_position_event(rpc_log(unknown, 1, 0)).is_none());

        // Right topic, truncated data
        let malformed = LogData::new_unchecked(
            vec![
                event_signatures::POSITION_OPENED,
                B256::ZERO,
                B256::ZERO,
            ],
            Bytes::from(vec![0u8; 16]),
        );
        assert!(parse_position_event(rpc_log(malformed, 1, 0)).is_none());

        let mut removed = rpc_log(
            IPositionManager::PositionLiquidated {
                tokenId: U256::from(2u64),
                owner: Address::ZERO,
            }
            .encode_log_data(),
            1,
            0,
        );
        removed.removed = true;
        assert!(parse_position_event(removed).is_none());
    }

    /// Serve one subscription: confirm it, push one liquidation log, then
    /// close the socket. Returns how many connections were accepted.
    async fn serve_one_log_then_drop(listener: tokio::net::TcpListener) -> usize {
        use tokio_tungstenite::tungstenite::Message;

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let Ok(text) = msg.to_text() else { continue };
            let request: serde_json::Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if request["method"] != "eth_subscribe" {
                continue;
            }

            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": "0x1",
            });
            ws.send(Message::text(reply.to_string())).await.unwrap();

            // Let the client attach to the subscription before it is fed
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;

            let notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {
                    "subscription": "0x1",
                    "result": {
                        "address": format!("{}", Address::repeat_byte(0xaa)),
                        "topics": [
                            format!("{}", event_signatures::POSITION_LIQUIDATED),
                            format!("0x{:064x}", 2),
                            format!("0x{:064x}", 0),
                        ],
                        "data": "0x",
                        "blockNumber": "0x2a",
                        "blockHash": format!("{}", B256::repeat_byte(0x22)),
                        "transactionHash": format!("{}", B256::repeat_byte(0x11)),
                        "transactionIndex": "0x0",
                        "logIndex": "0x0",
                        "removed": false,
                    },
                },
            });
            ws.send(Message::text(notification.to_string())).await.unwrap();
            break;
        }

        let _ = ws.close(None).await;
        drop(ws);

        // A reconnecting client would come back here
        let mut accepted = 1;
        if let Ok(Ok(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(500), listener.accept()).await
        {
            accepted += 1;
        }
        accepted
    }

    #[tokio::test]
    async fn test_dropped_socket_ends_live_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one_log_then_drop(listener));

        let events = EventListener::new(
            "http://127.0.0.1:1",
            Some(format!("ws://{}", addr)),
            Address::repeat_byte(0xaa),
        );
        let mut stream = events.subscribe().await.unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_type(), "PositionLiquidated");
        assert_eq!(first.token_id(), U256::from(2u64));
        assert_eq!(first.block_number(), 42);

        // The stream ends instead of resubscribing on a fresh socket
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());

        assert_eq!(server.await.unwrap(), 1);
    }

    #[test]
    fn test_listener_without_ws_has_no_live_support() {
        let listener = EventListener::new("http://127.0.0.1:8545", None, Address::ZERO);
        assert!(!listener.supports_live());

        let blank = EventListener::new("http://127.0.0.1:8545", Some("  ".into()), Address::ZERO);
        assert!(!blank.supports_live());

        let live = EventListener::new(
            "http://127.0.0.1:8545",
            Some("ws://127.0.0.1:8546".into()),
            Address::ZERO,
        );
        assert!(live.supports_live());
    }
}
