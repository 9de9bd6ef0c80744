//! Keeper core logic.
//!
//! This crate provides the keeper's long-running services:
//! - Position indexer (live-only or backfill-then-live)
//! - Liquidation sweeps over the maintenance-margin risk model
//! - Scheduled funding rate updates
//! - Configuration loading and validation
//! - Orchestration and cooperative shutdown

pub mod config;
pub mod fixed_math;
mod funding;
mod indexer;
mod liquidator;
mod orchestrator;
pub mod risk;
mod shutdown;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, GasPricing, IndexerMode, KeeperConfig, LogFormat};
pub use funding::{FundingOutcome, FundingUpdater, FUNDING_COOLDOWN};
pub use indexer::{Indexer, IndexerError, IndexerSettings};
pub use liquidator::{LiquidationOutcome, Liquidator, SweepReport};
pub use orchestrator::Orchestrator;
pub use risk::{assess, MarketSnapshot, RiskAssessment, RiskError, RiskInputs};
pub use shutdown::Shutdown;
