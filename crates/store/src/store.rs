//! SQLite-backed position store.
//!
//! Holds the durable mirror of on-chain positions, the indexer checkpoint and
//! the append-only audit trails. Every write is a single statement, so
//! concurrent writers from the indexer and liquidator never interleave
//! partially. The `is_active` flag only moves towards `false`, which makes
//! concurrent mark-inactive/upsert calls commutative.

use alloy::primitives::{Address, B256, I256, U256};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::models::{FundingUpdateRecord, IndexerCheckpoint, LiquidationAttempt, Position};

/// Durable store for positions, checkpoint and audit records.
#[derive(Clone)]
pub struct PositionStore {
    pool: SqlitePool,
}

impl PositionStore {
    /// Connect to the database and run migrations.
    ///
    /// `database_url` is a sqlx SQLite URL such as `sqlite://keeper.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open database at {}", database_url))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        info!(url = database_url, "Position store connected");
        Ok(Self { pool })
    }

    /// Create an in-memory store (tests, dry runs).
    ///
    /// Uses a single connection that never expires: each SQLite memory
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Close the underlying pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Position store closed");
    }

    // ------------------------------------------------------------------
    // Indexer checkpoint
    // ------------------------------------------------------------------

    /// Get the indexer checkpoint, or a zeroed default if never written.
    pub async fn checkpoint(&self) -> Result<IndexerCheckpoint> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT last_processed_block, last_update_time FROM indexer_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(block, time)| IndexerCheckpoint {
                last_processed_block: block as u64,
                last_update_time: time,
            })
            .unwrap_or_default())
    }

    /// Advance the checkpoint to `block`. Never moves it backwards.
    pub async fn advance_checkpoint(&self, block: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r"
            INSERT INTO indexer_state (id, last_processed_block, last_update_time)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                last_processed_block = MAX(indexer_state.last_processed_block, excluded.last_processed_block),
                last_update_time = excluded.last_update_time
            ",
        )
        .bind(block as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(block = block, "Checkpoint advanced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Insert or fully replace a position by token id.
    ///
    /// An already inactive row stays inactive, and `last_checked` is left
    /// untouched, so replaying an open event is harmless.
    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO positions (token_id, owner, collateral, leverage, entry_price,
                                   entry_funding_rate, is_long, size, is_active,
                                   block_number, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(token_id) DO UPDATE SET
                owner = excluded.owner,
                collateral = excluded.collateral,
                leverage = excluded.leverage,
                entry_price = excluded.entry_price,
                entry_funding_rate = excluded.entry_funding_rate,
                is_long = excluded.is_long,
                size = excluded.size,
                is_active = positions.is_active AND excluded.is_active,
                block_number = excluded.block_number,
                timestamp = excluded.timestamp
            ",
        )
        .bind(position.token_id.to_string())
        .bind(position.owner.to_string())
        .bind(position.collateral.to_string())
        .bind(position.leverage as i64)
        .bind(position.entry_price.to_string())
        .bind(position.entry_funding_rate.to_string())
        .bind(position.is_long)
        .bind(position.size.to_string())
        .bind(position.is_active)
        .bind(position.block_number as i64)
        .bind(position.timestamp as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert position {}", position.token_id))?;

        Ok(())
    }

    /// Get a single position by token id.
    pub async fn get_position(&self, token_id: U256) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE token_id = ?1")
            .bind(token_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(position_from_row).transpose()
    }

    /// List all active positions.
    pub async fn active_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(position_from_row).collect()
    }

    /// Total number of mirrored positions (active or not).
    pub async fn count_positions(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM positions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Flag a position inactive. Returns false if the token id is unknown.
    pub async fn mark_inactive(&self, token_id: U256) -> Result<bool> {
        let result = sqlx::query("UPDATE positions SET is_active = 0 WHERE token_id = ?1")
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stamp `last_checked` with the current time.
    pub async fn touch_last_checked(&self, token_id: U256) -> Result<()> {
        sqlx::query("UPDATE positions SET last_checked = ?1 WHERE token_id = ?2")
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit trails (append-only)
    // ------------------------------------------------------------------

    pub async fn record_liquidation(&self, attempt: &LiquidationAttempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO liquidation_attempts (token_id, timestamp, success, tx_hash, error)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(attempt.token_id.to_string())
        .bind(attempt.timestamp)
        .bind(attempt.success)
        .bind(attempt.tx_hash.map(|h| h.to_string()))
        .bind(attempt.error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_funding_update(&self, record: &FundingUpdateRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO funding_updates (block_number, timestamp, funding_rate, tx_hash)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(record.block_number as i64)
        .bind(record.timestamp)
        .bind(record.resulting_rate.map(|r| r.to_string()))
        .bind(record.tx_hash.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Liquidation attempts for one token, oldest first.
    pub async fn liquidation_attempts_for(&self, token_id: U256) -> Result<Vec<LiquidationAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM liquidation_attempts WHERE token_id = ?1 ORDER BY id ASC",
        )
        .bind(token_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let tx_hash: Option<String> = row.try_get("tx_hash")?;
                Ok(LiquidationAttempt {
                    token_id: parse_u256(&row.try_get::<String, _>("token_id")?)?,
                    timestamp: row.try_get("timestamp")?,
                    success: row.try_get("success")?,
                    tx_hash: tx_hash.as_deref().map(parse_b256).transpose()?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    /// All funding update records, oldest first.
    pub async fn funding_updates(&self) -> Result<Vec<FundingUpdateRecord>> {
        let rows = sqlx::query("SELECT * FROM funding_updates ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let rate: Option<String> = row.try_get("funding_rate")?;
                Ok(FundingUpdateRecord {
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                    timestamp: row.try_get("timestamp")?,
                    resulting_rate: rate.as_deref().map(parse_i256).transpose()?,
                    tx_hash: parse_b256(&row.try_get::<String, _>("tx_hash")?)?,
                })
            })
            .collect()
    }
}

fn position_from_row(row: &SqliteRow) -> Result<Position> {
    let owner: String = row.try_get("owner")?;
    Ok(Position {
        token_id: parse_u256(&row.try_get::<String, _>("token_id")?)?,
        owner: owner
            .parse::<Address>()
            .with_context(|| format!("Invalid owner address: {}", owner))?,
        collateral: parse_u256(&row.try_get::<String, _>("collateral")?)?,
        leverage: row.try_get::<i64, _>("leverage")? as u64,
        entry_price: parse_u256(&row.try_get::<String, _>("entry_price")?)?,
        entry_funding_rate: parse_i256(&row.try_get::<String, _>("entry_funding_rate")?)?,
        is_long: row.try_get("is_long")?,
        size: parse_u256(&row.try_get::<String, _>("size")?)?,
        is_active: row.try_get("is_active")?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        timestamp: row.try_get::<i64, _>("timestamp")? as u64,
        last_checked: row.try_get("last_checked")?,
    })
}

fn parse_u256(s: &str) -> Result<U256> {
    s.parse::<U256>()
        .with_context(|| format!("Invalid uint256 in store: {}", s))
}

fn parse_i256(s: &str) -> Result<I256> {
    I256::from_dec_str(s).with_context(|| format!("Invalid int256 in store: {}", s))
}

fn parse_b256(s: &str) -> Result<B256> {
    s.parse::<B256>()
        .with_context(|| format!("Invalid hash in store: {}", s))
}
