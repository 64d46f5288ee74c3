//! PostgreSQL outbox store for the courier event bus.
//!
//! Every published event is written here before it is queued, and every
//! status change the bus makes is mirrored onto the row. On startup the bus
//! reloads all `NACK` rows, so events survive a crash of the process.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!     id BIGSERIAL PRIMARY KEY,
//!     data BYTEA NOT NULL,
//!     topic TEXT NOT NULL,
//!     retry INTEGER NOT NULL DEFAULT 0,
//!     -- whole minutes
//!     next_retry INTEGER NOT NULL DEFAULT 0,
//!     ack_status TEXT NOT NULL DEFAULT 'NACK',
//!
//!     -- Unix seconds
//!     created_at BIGINT NOT NULL,
//!     updated_at BIGINT NOT NULL,
//!
//!     UNIQUE (data, topic)
//! );
//!
//! CREATE INDEX idx_outbox_events_pending ON outbox_events (id)
//!     WHERE ack_status = 'NACK';
//! ```
//!
//! [`PgOutboxStore::migrate`] creates both if they are missing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier::EventBus;
//! use courier_outbox_postgres::PgOutboxStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgOutboxStore::new(pool);
//! store.migrate().await?;
//!
//! let bus = EventBus::builder().with_outbox(store).build();
//! ```

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier::{OutboxRecord, OutboxStatus, OutboxStore};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub const DEFAULT_TABLE: &str = "outbox_events";

/// PostgreSQL outbox store.
#[derive(Clone, Debug)]
pub struct PgOutboxStore {
    pool: PgPool,
    table: String,
}

impl PgOutboxStore {
    /// Store rows in [`DEFAULT_TABLE`].
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Store rows in `table`, which may be schema-qualified
    /// (`events.outbox`).
    ///
    /// The name is spliced into SQL, so only ASCII letters, digits,
    /// underscores and a single dot are accepted.
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the outbox table and its pending index if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let table = &self.table;
        let index = format!("idx_{}_pending", table.replace('.', "_"));

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                data BYTEA NOT NULL,
                topic TEXT NOT NULL,
                retry INTEGER NOT NULL DEFAULT 0,
                next_retry INTEGER NOT NULL DEFAULT 0,
                ack_status TEXT NOT NULL DEFAULT 'NACK',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (data, topic)
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create outbox table {table}"))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (id) WHERE ack_status = 'NACK'"
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create pending index on {table}"))?;

        Ok(())
    }

    async fn set_status(&self, id: i64, status: OutboxStatus) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET ack_status = $1,
                updated_at = $2
            WHERE id = $3
            "#,
            self.table
        ))
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark outbox event {id} as {status}"))?;

        ensure!(result.rows_affected() > 0, "outbox event {id} not found");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    /// Insert a row, or refresh the existing row for the same
    /// `(data, topic)` pair. `created_at` of an existing row is kept.
    async fn insert_event(&self, record: &OutboxRecord) -> Result<OutboxRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (data, topic, retry, next_retry, ack_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (data, topic) DO UPDATE
            SET retry = EXCLUDED.retry,
                next_retry = EXCLUDED.next_retry,
                ack_status = EXCLUDED.ack_status,
                updated_at = EXCLUDED.updated_at
            RETURNING id, data, topic, retry, next_retry, ack_status, created_at, updated_at
            "#,
            self.table
        ))
        .bind(&record.data)
        .bind(&record.topic)
        .bind(record.retry)
        .bind(minutes_to_column(record.next_retry))
        .bind(record.ack_status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert outbox event for topic {}", record.topic))?;

        record_from_row(&row)
    }

    async fn load_pending_events(&self) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, data, topic, retry, next_retry, ack_status, created_at, updated_at
            FROM {}
            WHERE ack_status = $1
            ORDER BY id ASC
            "#,
            self.table
        ))
        .bind(OutboxStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to load pending outbox events")?;

        rows.iter().map(record_from_row).collect()
    }

    async fn update_event_status(&self, record: &OutboxRecord) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET retry = $1,
                next_retry = $2,
                ack_status = $3,
                updated_at = $4
            WHERE id = $5
            "#,
            self.table
        ))
        .bind(record.retry)
        .bind(minutes_to_column(record.next_retry))
        .bind(record.ack_status.as_str())
        .bind(Utc::now().timestamp())
        .bind(record.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update outbox event {}", record.id))?;

        ensure!(result.rows_affected() > 0, "outbox event {} not found", record.id);
        Ok(())
    }

    async fn mark_event_as_processed(&self, id: i64) -> Result<()> {
        self.set_status(id, OutboxStatus::Processed).await
    }

    async fn mark_event_as_failed(&self, id: i64) -> Result<()> {
        self.set_status(id, OutboxStatus::Failed).await
    }
}

/// Maintenance helpers.
impl PgOutboxStore {
    /// Delete processed rows last touched before `older_than`.
    ///
    /// Failed rows are kept for inspection; remove them with
    /// [`cleanup_failed`](Self::cleanup_failed).
    pub async fn cleanup_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.delete_with_status(OutboxStatus::Processed, older_than).await
    }

    pub async fn cleanup_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.delete_with_status(OutboxStatus::Failed, older_than).await
    }

    /// Put failed rows back into the pending set with a fresh retry count,
    /// so the next start replays them.
    pub async fn requeue_failed(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET ack_status = $1,
                retry = 0,
                next_retry = 0,
                updated_at = $2
            WHERE ack_status = $3
            "#,
            self.table
        ))
        .bind(OutboxStatus::Pending.as_str())
        .bind(Utc::now().timestamp())
        .bind(OutboxStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .context("failed to requeue failed outbox events")?;

        Ok(result.rows_affected())
    }

    /// Row counts per status.
    pub async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE ack_status = 'NACK') as pending,
                COUNT(*) FILTER (WHERE ack_status = 'ACK') as processed,
                COUNT(*) FILTER (WHERE ack_status = 'FAILED') as failed
            FROM {}
            "#,
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .context("failed to read outbox stats")?;

        Ok(OutboxStats {
            pending: row.try_get("pending")?,
            processed: row.try_get("processed")?,
            failed: row.try_get("failed")?,
        })
    }

    async fn delete_with_status(&self, status: OutboxStatus, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM {}
            WHERE ack_status = $1
              AND updated_at < $2
            "#,
            self.table
        ))
        .bind(status.as_str())
        .bind(older_than.timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to delete {status} outbox events"))?;

        Ok(result.rows_affected())
    }
}

/// Outbox row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord> {
    let status: String = row.try_get("ack_status")?;
    let next_retry: i32 = row.try_get("next_retry")?;

    Ok(OutboxRecord {
        id: row.try_get("id")?,
        data: row.try_get("data")?,
        topic: row.try_get("topic")?,
        retry: row.try_get("retry")?,
        next_retry: u32::try_from(next_retry).unwrap_or_default(),
        ack_status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn minutes_to_column(minutes: u32) -> i32 {
    i32::try_from(minutes).unwrap_or(i32::MAX)
}

fn validate_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        bail!("invalid outbox table name {table:?}: at most one schema qualifier");
    }
    for part in parts {
        let valid = part
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        ensure!(valid, "invalid outbox table name {table:?}");
    }
    Ok(())
}
