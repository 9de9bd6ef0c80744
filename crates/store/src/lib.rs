//! Keeper persistence layer.
//!
//! This crate provides:
//! - The persisted data model (positions, checkpoint, audit records)
//! - A SQLite-backed [`PositionStore`] with embedded migrations

mod models;
mod store;

pub use models::{FundingUpdateRecord, IndexerCheckpoint, LiquidationAttempt, Position};
pub use store::PositionStore;
