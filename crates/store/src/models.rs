//! Persisted data model.

use alloy::primitives::{Address, B256, I256, U256};

/// A mirrored on-chain position.
///
/// Positions are keyed by `token_id` and never deleted. `is_active` only
/// ever moves from `true` to `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Position NFT token id (unique key)
    pub token_id: U256,
    /// Position owner
    pub owner: Address,
    /// Collateral (18-decimal fixed point)
    pub collateral: U256,
    /// Leverage multiplier
    pub leverage: u64,
    /// Entry price (18-decimal fixed point)
    pub entry_price: U256,
    /// Accumulated funding at open time (10,000 = 100%)
    pub entry_funding_rate: I256,
    /// Long or short
    pub is_long: bool,
    /// Notional size (collateral * leverage)
    pub size: U256,
    /// False once closed or liquidated
    pub is_active: bool,
    /// Block of the last lifecycle event
    pub block_number: u64,
    /// Unix seconds of the last lifecycle event
    pub timestamp: u64,
    /// Unix millis of the last liquidation sweep that evaluated this position
    pub last_checked: Option<i64>,
}

impl Position {
    /// Build a freshly opened, active position.
    #[allow(clippy::too_many_arguments)]
    pub fn opened(
        token_id: U256,
        owner: Address,
        collateral: U256,
        leverage: u64,
        entry_price: U256,
        entry_funding_rate: I256,
        is_long: bool,
        block_number: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            token_id,
            owner,
            collateral,
            leverage,
            entry_price,
            entry_funding_rate,
            is_long,
            size: collateral.saturating_mul(U256::from(leverage)),
            is_active: true,
            block_number,
            timestamp,
            last_checked: None,
        }
    }

    /// Short label for logs.
    pub fn side(&self) -> &'static str {
        if self.is_long {
            "LONG"
        } else {
            "SHORT"
        }
    }
}

/// Indexer progress (singleton).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexerCheckpoint {
    pub last_processed_block: u64,
    /// Unix millis of the last advance (0 if never written)
    pub last_update_time: i64,
}

/// One liquidation try, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationAttempt {
    pub token_id: U256,
    /// Unix millis
    pub timestamp: i64,
    pub success: bool,
    pub tx_hash: Option<B256>,
    pub error: Option<String>,
}

impl LiquidationAttempt {
    pub fn succeeded(token_id: U256, tx_hash: B256) -> Self {
        Self {
            token_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            success: true,
            tx_hash: Some(tx_hash),
            error: None,
        }
    }

    pub fn failed(token_id: U256, error: impl Into<String>) -> Self {
        Self {
            token_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            success: false,
            tx_hash: None,
            error: Some(error.into()),
        }
    }
}

/// Audit record of a confirmed funding rate update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingUpdateRecord {
    pub block_number: u64,
    /// Unix seconds
    pub timestamp: i64,
    /// Funding rate read back after the update, if the read succeeded
    pub resulting_rate: Option<I256>,
    pub tx_hash: B256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opened_position_size() {
        let collateral = U256::from(1000u64) * U256::from(10u64).pow(U256::from(18u64));
        let position = Position::opened(
            U256::from(7u64),
            Address::repeat_byte(1),
            collateral,
            10,
            U256::from(100u64),
            I256::ZERO,
            true,
            42,
            1_700_000_000,
        );

        assert!(position.is_active);
        assert_eq!(position.size, collateral * U256::from(10u64));
        assert_eq!(position.last_checked, None);
        assert_eq!(position.side(), "LONG");
    }

    #[test]
    fn test_attempt_constructors() {
        let ok = LiquidationAttempt::succeeded(U256::from(1u64), B256::repeat_byte(2));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = LiquidationAttempt::failed(U256::from(1u64), "reverted");
        assert!(!failed.success);
        assert!(failed.tx_hash.is_none());
        assert_eq!(failed.error.as_deref(), Some("reverted"));
    }
}
