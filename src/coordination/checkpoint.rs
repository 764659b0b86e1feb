//! Per-file load progress, persisted so an interrupted run can resume
//!
//! A checkpoint is keyed by (file name, data row count). A re-exported file
//! with a different row count gets a fresh checkpoint instead of resuming at an
//! offset that belongs to another version of the file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::config::CHECKPOINT_TABLE;
use crate::db::{BackendKind, Pool, PoolConnection};
use crate::error::LoaderError;
use crate::io::SourceFile;

/// Progress record for one version of one export file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCheckpoint {
    pub file_name: String,
    pub file_total_rows: u64,
    pub target_entity: String,
    pub rows_committed: u64,
    pub created_at: DateTime<Utc>,
}

impl LoadCheckpoint {
    pub fn new(file: &SourceFile) -> Self {
        Self {
            file_name: file.file_name.clone(),
            file_total_rows: file.total_rows,
            target_entity: file.entity.clone(),
            rows_committed: 0,
            created_at: Utc::now(),
        }
    }

    /// Every data row of the file has been committed
    pub fn is_complete(&self) -> bool {
        self.rows_committed >= self.file_total_rows
    }

    /// Account for `rows` more committed rows
    pub fn advance(&mut self, rows: u64) -> Result<(), LoaderError> {
        let committed = self.rows_committed + rows;
        if committed > self.file_total_rows {
            return Err(LoaderError::CheckpointOverflow {
                file: self.file_name.clone(),
                committed,
                total: self.file_total_rows,
            });
        }
        self.rows_committed = committed;
        Ok(())
    }
}

/// Storage for load checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the backing storage if it does not exist
    async fn ensure_table(&self) -> Result<()>;

    /// Checkpoint for `file`, created with zero committed rows and persisted if absent
    async fn get_or_create(&self, file: &SourceFile) -> Result<LoadCheckpoint>;

    /// Persist `rows_committed`; durable once this returns
    async fn save(&self, checkpoint: &LoadCheckpoint) -> Result<()>;

    /// Zero the progress of every checkpoint targeting `entity`, returns how many were reset
    async fn reset_for_entity(&self, entity: &str) -> Result<u64>;

    /// Forget all progress
    async fn drop_table(&self) -> Result<()>;
}

/// Checkpoints kept in a table of the target database
pub struct TableCheckpointStore {
    pool: Pool,
    table: String,
}

impl TableCheckpointStore {
    pub fn new(pool: Pool, schema: &str) -> Self {
        let table = pool.qualified_table_name(schema, CHECKPOINT_TABLE);
        Self { pool, table }
    }

    fn create_table_sql(&self) -> String {
        match self.pool.kind() {
            BackendKind::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 \x20 filename VARCHAR NOT NULL,\n\
                 \x20 file_total_rows BIGINT NOT NULL,\n\
                 \x20 target_tablename VARCHAR NOT NULL,\n\
                 \x20 rows_committed BIGINT NOT NULL DEFAULT 0,\n\
                 \x20 created_at TIMESTAMPTZ NOT NULL,\n\
                 \x20 PRIMARY KEY (filename, file_total_rows)\n\
                 )",
                self.table
            ),
            BackendKind::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 \x20 filename TEXT NOT NULL,\n\
                 \x20 file_total_rows INTEGER NOT NULL,\n\
                 \x20 target_tablename TEXT NOT NULL,\n\
                 \x20 rows_committed INTEGER NOT NULL DEFAULT 0,\n\
                 \x20 created_at TEXT NOT NULL,\n\
                 \x20 PRIMARY KEY (filename, file_total_rows)\n\
                 )",
                self.table
            ),
        }
    }

    async fn find(&self, file_name: &str, total_rows: i64) -> Result<Option<CheckpointRow>> {
        let row = match self.pool.acquire().await? {
            PoolConnection::Postgres(mut conn) => {
                sqlx::query_as::<_, CheckpointRow>(&format!(
                    "SELECT filename, file_total_rows, target_tablename, rows_committed, created_at \
                     FROM {} WHERE filename = $1 AND file_total_rows = $2",
                    self.table
                ))
                .bind(file_name)
                .bind(total_rows)
                .fetch_optional(&mut *conn)
                .await?
            }
            PoolConnection::Sqlite(mut conn) => {
                sqlx::query_as::<_, CheckpointRow>(&format!(
                    "SELECT filename, file_total_rows, target_tablename, rows_committed, created_at \
                     FROM {} WHERE filename = ? AND file_total_rows = ?",
                    self.table
                ))
                .bind(file_name)
                .bind(total_rows)
                .fetch_optional(&mut *conn)
                .await?
            }
        };
        Ok(row)
    }

    async fn upsert(&self, checkpoint: &LoadCheckpoint) -> Result<()> {
        let total_rows = to_i64(checkpoint.file_total_rows)?;
        let rows_committed = to_i64(checkpoint.rows_committed)?;

        match self.pool.acquire().await? {
            PoolConnection::Postgres(mut conn) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (filename, file_total_rows, target_tablename, rows_committed, created_at) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (filename, file_total_rows) DO UPDATE SET rows_committed = EXCLUDED.rows_committed",
                    self.table
                ))
                .bind(&checkpoint.file_name)
                .bind(total_rows)
                .bind(&checkpoint.target_entity)
                .bind(rows_committed)
                .bind(checkpoint.created_at)
                .execute(&mut *conn)
                .await?;
            }
            PoolConnection::Sqlite(mut conn) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (filename, file_total_rows, target_tablename, rows_committed, created_at) \
                     VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT (filename, file_total_rows) DO UPDATE SET rows_committed = excluded.rows_committed",
                    self.table
                ))
                .bind(&checkpoint.file_name)
                .bind(total_rows)
                .bind(&checkpoint.target_entity)
                .bind(rows_committed)
                .bind(checkpoint.created_at)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    filename: String,
    file_total_rows: i64,
    target_tablename: String,
    rows_committed: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for LoadCheckpoint {
    type Error = anyhow::Error;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(Self {
            file_total_rows: u64::try_from(row.file_total_rows)
                .context("Negative row count in checkpoint table")?,
            rows_committed: u64::try_from(row.rows_committed)
                .context("Negative committed row count in checkpoint table")?,
            file_name: row.filename,
            target_entity: row.target_tablename,
            created_at: row.created_at,
        })
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).context("Row count does not fit the checkpoint table")
}

#[async_trait]
impl CheckpointStore for TableCheckpointStore {
    async fn ensure_table(&self) -> Result<()> {
        self.pool
            .execute_query(&self.create_table_sql())
            .await
            .context("Failed to create checkpoint table")
    }

    async fn get_or_create(&self, file: &SourceFile) -> Result<LoadCheckpoint> {
        let existing = self
            .find(&file.file_name, to_i64(file.total_rows)?)
            .await
            .with_context(|| format!("Failed to read checkpoint for {}", file.file_name))?;

        if let Some(row) = existing {
            return row.try_into();
        }

        let checkpoint = LoadCheckpoint::new(file);
        self.upsert(&checkpoint)
            .await
            .with_context(|| format!("Failed to create checkpoint for {}", file.file_name))?;
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &LoadCheckpoint) -> Result<()> {
        self.upsert(checkpoint)
            .await
            .with_context(|| format!("Failed to save checkpoint for {}", checkpoint.file_name))
    }

    async fn reset_for_entity(&self, entity: &str) -> Result<u64> {
        let affected = match self.pool.acquire().await? {
            PoolConnection::Postgres(mut conn) => sqlx::query(&format!(
                "UPDATE {} SET rows_committed = 0 WHERE target_tablename = $1",
                self.table
            ))
            .bind(entity)
            .execute(&mut *conn)
            .await
            .map(|r| r.rows_affected()),
            PoolConnection::Sqlite(mut conn) => sqlx::query(&format!(
                "UPDATE {} SET rows_committed = 0 WHERE target_tablename = ?",
                self.table
            ))
            .bind(entity)
            .execute(&mut *conn)
            .await
            .map(|r| r.rows_affected()),
        }
        .with_context(|| format!("Failed to reset checkpoints of {}", entity))?;

        info!(entity, checkpoints = affected, "Reset load checkpoints");
        Ok(affected)
    }

    async fn drop_table(&self) -> Result<()> {
        self.pool
            .execute_query(&format!("DROP TABLE IF EXISTS {}", self.table))
            .await
            .context("Failed to drop checkpoint table")
    }
}

/// Checkpoints that live only as long as the process, used when checkpointing is off
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<(String, u64), LoadCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, u64), LoadCheckpoint>>> {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("Checkpoint store lock poisoned"))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn get_or_create(&self, file: &SourceFile) -> Result<LoadCheckpoint> {
        let mut checkpoints = self.lock()?;
        Ok(checkpoints
            .entry((file.file_name.clone(), file.total_rows))
            .or_insert_with(|| LoadCheckpoint::new(file))
            .clone())
    }

    async fn save(&self, checkpoint: &LoadCheckpoint) -> Result<()> {
        self.lock()?.insert(
            (checkpoint.file_name.clone(), checkpoint.file_total_rows),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn reset_for_entity(&self, entity: &str) -> Result<u64> {
        let mut reset = 0;
        for checkpoint in self.lock()?.values_mut() {
            if checkpoint.target_entity == entity {
                checkpoint.rows_committed = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn drop_table(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }
}
