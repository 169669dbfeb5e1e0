//! PostgreSQL swap store

use super::{
    parse_stored_status, parse_stored_swap_type, parse_stored_value, Direction, Swap, SwapResult,
    SwapStats, SwapStatus, SwapStore,
};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Swap store backed by PostgreSQL
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(BridgeError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                tx_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                bind_addr TEXT NOT NULL,
                value TEXT NOT NULL,
                memo TEXT,
                status TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (tx_id, direction)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_scan
            ON swaps (direction, status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_results (
                tx_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                bind_addr TEXT NOT NULL,
                value TEXT NOT NULL,
                memo TEXT,
                swap_tx TEXT NOT NULL DEFAULT '',
                swap_height BIGINT NOT NULL DEFAULT 0,
                swap_time BIGINT NOT NULL DEFAULT 0,
                swap_value TEXT NOT NULL,
                swap_type TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (tx_id, direction)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_results_unconfirmed
            ON swap_results (direction, swap_height)
            WHERE swap_tx <> ''
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(BridgeError::Database)?;
        Ok(())
    }

    fn row_to_swap(row: &sqlx::postgres::PgRow) -> BridgeResult<Swap> {
        let direction: String = row.get("direction");
        let direction = match direction.as_str() {
            "swapin" => Direction::Swapin,
            "swapout" => Direction::Swapout,
            other => {
                return Err(BridgeError::Internal(format!("bad stored direction {other}")))
            }
        };
        Ok(Swap {
            tx_id: row.get("tx_id"),
            direction,
            from: row.get("from_addr"),
            bind: row.get("bind_addr"),
            value: parse_stored_value(row.get::<String, _>("value").as_str())?,
            memo: row.get("memo"),
            status: parse_stored_status(row.get::<String, _>("status").as_str())?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_result(row: &sqlx::postgres::PgRow) -> BridgeResult<SwapResult> {
        let direction: String = row.get("direction");
        let direction = match direction.as_str() {
            "swapin" => Direction::Swapin,
            "swapout" => Direction::Swapout,
            other => {
                return Err(BridgeError::Internal(format!("bad stored direction {other}")))
            }
        };
        Ok(SwapResult {
            tx_id: row.get("tx_id"),
            direction,
            from: row.get("from_addr"),
            bind: row.get("bind_addr"),
            value: parse_stored_value(row.get::<String, _>("value").as_str())?,
            memo: row.get("memo"),
            swap_tx: row.get("swap_tx"),
            swap_height: row.get::<i64, _>("swap_height") as u64,
            swap_time: row.get::<i64, _>("swap_time") as u64,
            swap_value: parse_stored_value(row.get::<String, _>("swap_value").as_str())?,
            swap_type: parse_stored_swap_type(row.get::<String, _>("swap_type").as_str())?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SwapStore for PostgresStore {
    async fn add_swap(&self, swap: &Swap) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swaps
                (tx_id, direction, from_addr, bind_addr, value, memo, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tx_id, direction) DO NOTHING
            "#,
        )
        .bind(&swap.tx_id)
        .bind(swap.direction.as_str())
        .bind(&swap.from)
        .bind(&swap.bind)
        .bind(swap.value.to_string())
        .bind(&swap.memo)
        .bind(swap.status.as_str())
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_swap(&self, tx_id: &str, direction: Direction) -> BridgeResult<Option<Swap>> {
        let row = sqlx::query("SELECT * FROM swaps WHERE tx_id = $1 AND direction = $2")
            .bind(tx_id)
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_swap).transpose()
    }

    async fn find_swaps_with_status(
        &self,
        direction: Direction,
        status: SwapStatus,
        after: i64,
    ) -> BridgeResult<Vec<Swap>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM swaps
            WHERE direction = $1 AND status = $2 AND created_at >= $3
            ORDER BY created_at
            "#,
        )
        .bind(direction.as_str())
        .bind(status.as_str())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_swap).collect()
    }

    async fn update_swap_status(
        &self,
        tx_id: &str,
        direction: Direction,
        expected: SwapStatus,
        new: SwapStatus,
        timestamp: i64,
        memo: Option<&str>,
    ) -> BridgeResult<bool> {
        if !expected.can_transition_to(new) {
            return Err(BridgeError::Internal(format!(
                "illegal status transition {expected} -> {new}"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE swaps
            SET status = $1, updated_at = $2, memo = COALESCE($3, memo)
            WHERE tx_id = $4 AND direction = $5 AND status = $6
            "#,
        )
        .bind(new.as_str())
        .bind(timestamp)
        .bind(memo)
        .bind(tx_id)
        .bind(direction.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!("status transition {} -> {} lost for {} {}", expected, new, direction, tx_id);
        }
        Ok(applied)
    }

    async fn add_swap_result(&self, result: &SwapResult) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swap_results
                (tx_id, direction, from_addr, bind_addr, value, memo,
                 swap_tx, swap_height, swap_time, swap_value, swap_type,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (tx_id, direction) DO NOTHING
            "#,
        )
        .bind(&result.tx_id)
        .bind(result.direction.as_str())
        .bind(&result.from)
        .bind(&result.bind)
        .bind(result.value.to_string())
        .bind(&result.memo)
        .bind(&result.swap_tx)
        .bind(result.swap_height as i64)
        .bind(result.swap_time as i64)
        .bind(result.swap_value.to_string())
        .bind(result.swap_type.as_str())
        .bind(result.created_at)
        .bind(result.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_swap_result(
        &self,
        tx_id: &str,
        direction: Direction,
    ) -> BridgeResult<Option<SwapResult>> {
        let row = sqlx::query("SELECT * FROM swap_results WHERE tx_id = $1 AND direction = $2")
            .bind(tx_id)
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_result).transpose()
    }

    async fn update_result_swap_tx(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_tx: &str,
        timestamp: i64,
    ) -> BridgeResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE swap_results
            SET swap_tx = $1, updated_at = $2
            WHERE tx_id = $3 AND direction = $4 AND swap_tx = ''
            "#,
        )
        .bind(swap_tx)
        .bind(timestamp)
        .bind(tx_id)
        .bind(direction.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_result_confirmed(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_height: u64,
        swap_time: u64,
        timestamp: i64,
    ) -> BridgeResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE swap_results
            SET swap_height = $1, swap_time = $2, updated_at = $3
            WHERE tx_id = $4 AND direction = $5 AND swap_height = 0
            "#,
        )
        .bind(swap_height as i64)
        .bind(swap_time as i64)
        .bind(timestamp)
        .bind(tx_id)
        .bind(direction.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_results_to_confirm(&self, direction: Direction) -> BridgeResult<Vec<SwapResult>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM swap_results
            WHERE direction = $1 AND swap_tx <> '' AND swap_height = 0
            ORDER BY created_at
            "#,
        )
        .bind(direction.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_result).collect()
    }

    async fn stats(&self) -> BridgeResult<SwapStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'not_stable') as not_stable,
                COUNT(*) FILTER (WHERE status = 'not_swapped') as not_swapped,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'swapped') as swapped,
                COUNT(*) FILTER (WHERE status IN ('verify_failed', 'swap_failed')) as failed
            FROM swaps
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SwapStats {
            not_stable: row.get::<i64, _>("not_stable") as u64,
            not_swapped: row.get::<i64, _>("not_swapped") as u64,
            processing: row.get::<i64, _>("processing") as u64,
            swapped: row.get::<i64, _>("swapped") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }
}
