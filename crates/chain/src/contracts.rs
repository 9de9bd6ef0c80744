//! Contract bindings for the perpetuals protocol.
//!
//! Three contracts are involved:
//! - Position manager: lifecycle events, `liquidatePosition`, `updateFundingRate`,
//!   funding accumulator reads
//! - Price source (vAMM): current mark price with a validity flag
//! - Position registry (position NFT): per-token position data

use alloy::sol;

sol! {
    /// Position manager interface
    #[sol(rpc)]
    #[derive(Debug)]
    interface IPositionManager {
        event PositionOpened(
            uint256 indexed tokenId,
            address indexed owner,
            uint256 collateral,
            uint256 leverage,
            uint256 entryPrice,
            int256 entryFundingRate,
            bool isLong
        );

        event PositionClosed(
            uint256 indexed tokenId,
            address indexed owner,
            int256 pnl,
            int256 fundingPayment,
            uint256 fees
        );

        event PositionLiquidated(uint256 indexed tokenId, address indexed owner);

        function liquidatePosition(uint256 tokenId) external;

        function updateFundingRate() external;

        function fundingRateAccumulated() external view returns (int256);

        function getCurrentFundingRate() external view returns (int256);
    }

    /// Price source interface
    #[sol(rpc)]
    #[derive(Debug)]
    interface IPriceSource {
        function getCurrentPrice() external view returns (uint256 price, bool valid);
    }

    /// Position registry interface
    #[sol(rpc)]
    #[derive(Debug)]
    interface IPositionRegistry {
        function getPositionData(uint256 tokenId) external view returns (
            uint256 collateral,
            uint256 leverage,
            uint256 entryPrice,
            int256 entryFundingRate,
            bool isLong
        );
    }
}

/// Older position manager deployments emit `PositionOpened` without the
/// entry price; the indexer reads it from the registry instead.
pub mod compact {
    use alloy::sol;

    sol! {
        #[derive(Debug)]
        interface ICompactPositionEvents {
            event PositionOpened(
                uint256 indexed tokenId,
                address indexed owner,
                uint256 collateral,
                uint256 leverage,
                int256 entryFundingRate,
                bool isLong
            );
        }
    }
}

/// Event topic hashes used for log filtering.
pub mod event_signatures {
    use alloy::primitives::B256;
    use alloy::sol_types::SolEvent;

    use super::compact::ICompactPositionEvents;
    use super::IPositionManager;

    pub const POSITION_OPENED: B256 = IPositionManager::PositionOpened::SIGNATURE_HASH;
    pub const POSITION_OPENED_COMPACT: B256 =
        ICompactPositionEvents::PositionOpened::SIGNATURE_HASH;
    pub const POSITION_CLOSED: B256 = IPositionManager::PositionClosed::SIGNATURE_HASH;
    pub const POSITION_LIQUIDATED: B256 = IPositionManager::PositionLiquidated::SIGNATURE_HASH;

    /// All position lifecycle signatures.
    pub fn position_signatures() -> Vec<B256> {
        vec![
            POSITION_OPENED,
            POSITION_OPENED_COMPACT,
            POSITION_CLOSED,
            POSITION_LIQUIDATED,
        ]
    }
}
