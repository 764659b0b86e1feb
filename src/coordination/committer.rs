//! Streams one source file into its table, one checkpointed batch at a time
//!
//! Every batch is committed in its own transaction and the checkpoint is saved
//! right after. The two writes are not atomic: a crash between them leaves the
//! batch committed but not counted, and it is loaded again on resume.

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use sqlx::Connection;
use sqlx::postgres::PgConnection;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Sqlite, query::Query};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::checkpoint::{CheckpointStore, LoadCheckpoint};
use super::orchestrator::LoadConfig;
use crate::catalog::Catalog;
use crate::config::{QUERY_TIMEOUT, SQLITE_MAX_BIND_PARAMETERS};
use crate::db::constraints::column_list;
use crate::db::{BackendKind, Pool, PoolConnection};
use crate::formats::{CellValue, RowCaster, TsvReader};
use crate::io::SourceFile;
use crate::telemetry::TelemetryEvent;

/// Null marker of the COPY text format
const COPY_NULL: &str = "\\N";

/// How a batch reaches the database, fixed per backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitProtocol {
    /// `COPY .. FROM STDIN` with a tab-delimited payload
    BulkCopy,
    /// Parameterized `INSERT .. VALUES (..), (..)`
    MultiRowInsert,
}

impl CommitProtocol {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Postgres => CommitProtocol::BulkCopy,
            BackendKind::Sqlite => CommitProtocol::MultiRowInsert,
        }
    }
}

/// Outcome of loading one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub file_name: String,
    pub entity: String,
    pub total_rows: u64,
    /// Rows already committed when this run reached the file
    pub resumed_from: u64,
    /// Rows committed by this run
    pub rows_committed: u64,
    pub batches: u64,
    /// The checkpoint showed the file as fully loaded
    pub skipped: bool,
}

impl FileReport {
    fn new(file: &SourceFile, resumed_from: u64) -> Self {
        Self {
            file_name: file.file_name.clone(),
            entity: file.entity.clone(),
            total_rows: file.total_rows,
            resumed_from,
            rows_committed: 0,
            batches: 0,
            skipped: false,
        }
    }
}

pub struct BatchCommitter {
    pool: Pool,
    protocol: CommitProtocol,
    catalog: Arc<Catalog>,
    checkpoints: Arc<dyn CheckpointStore>,
    schema: String,
    flush_interval: usize,
    max_rows_per_file: Option<u64>,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl BatchCommitter {
    pub fn new(
        pool: Pool,
        catalog: Arc<Catalog>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &LoadConfig,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            protocol: CommitProtocol::for_backend(pool.kind()),
            pool,
            catalog,
            checkpoints,
            schema: config.schema.clone(),
            flush_interval: config.flush_interval.max(1),
            max_rows_per_file: config.max_rows_per_file,
            telemetry_tx,
        }
    }

    pub fn protocol(&self) -> CommitProtocol {
        self.protocol
    }

    /// Load `file` from its checkpoint onwards
    pub async fn load_file(&self, file: &SourceFile) -> Result<FileReport> {
        let mut checkpoint = self.checkpoints.get_or_create(file).await?;
        let mut report = FileReport::new(file, checkpoint.rows_committed);

        if checkpoint.is_complete() {
            info!(file = %file.file_name, rows = file.total_rows, "File already loaded, skipping");
            let _ = self.telemetry_tx.send(TelemetryEvent::FileSkipped {
                file_name: file.file_name.clone(),
                total_rows: file.total_rows,
            });
            report.skipped = true;
            return Ok(report);
        }

        let entity = self
            .catalog
            .entity(&file.entity)
            .with_context(|| format!("Table '{}' is not in the schema catalog", file.entity))?;
        let table = self.pool.qualified_table_name(&self.schema, &entity.table);

        let mut reader = TsvReader::open(&file.path)
            .await
            .with_context(|| format!("Failed to open {}", file.path.display()))?;
        let caster = RowCaster::new(&file.file_name, entity, reader.header())?;
        let columns = caster.column_names();

        // Checkpointed rows count toward the cap
        let cap = self.max_rows_per_file.unwrap_or(u64::MAX);
        let mut position = reader.skip(checkpoint.rows_committed.min(cap)).await?;

        info!(
            file = %file.file_name,
            entity = %entity.table,
            total_rows = file.total_rows,
            resumed_from = report.resumed_from,
            "Loading file"
        );
        let _ = self.telemetry_tx.send(TelemetryEvent::FileStarted {
            file_name: file.file_name.clone(),
            total_rows: file.total_rows,
            resumed_from: report.resumed_from,
        });

        let mut batch: Vec<Vec<CellValue>> = Vec::with_capacity(self.flush_interval);
        while position < cap {
            let Some(record) = reader.next_record().await? else {
                break;
            };
            position += 1;
            batch.push(caster.cast(&record)?);

            if batch.len() >= self.flush_interval {
                self.flush(&table, &columns, &mut batch, &mut checkpoint, &mut report)
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.flush(&table, &columns, &mut batch, &mut checkpoint, &mut report)
                .await?;
        }

        info!(
            file = %file.file_name,
            rows = report.rows_committed,
            batches = report.batches,
            "File loaded"
        );
        let _ = self.telemetry_tx.send(TelemetryEvent::FileCompleted {
            file_name: file.file_name.clone(),
        });

        Ok(report)
    }

    /// Commit the buffered rows, then advance and persist the checkpoint
    async fn flush(
        &self,
        table: &str,
        columns: &[String],
        batch: &mut Vec<Vec<CellValue>>,
        checkpoint: &mut LoadCheckpoint,
        report: &mut FileReport,
    ) -> Result<()> {
        let start = Instant::now();
        let rows = batch.len() as u64;

        let mut advanced = checkpoint.clone();
        advanced.advance(rows)?;

        self.commit_batch(table, columns, batch)
            .await
            .with_context(|| {
                format!(
                    "Failed to commit rows {}..{} of {} into {}",
                    checkpoint.rows_committed + 1,
                    advanced.rows_committed,
                    checkpoint.file_name,
                    table
                )
            })?;
        self.checkpoints.save(&advanced).await?;
        *checkpoint = advanced;
        batch.clear();

        report.rows_committed += rows;
        report.batches += 1;

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            file = %checkpoint.file_name,
            rows,
            committed = checkpoint.rows_committed,
            duration_ms,
            "Batch committed"
        );
        let _ = self
            .telemetry_tx
            .send(TelemetryEvent::BatchCommitted { rows, duration_ms });
        Ok(())
    }

    /// Write `rows` to `table` in a single transaction
    pub async fn commit_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<CellValue>],
    ) -> Result<()> {
        let commit = async {
            let conn = self
                .pool
                .acquire()
                .await
                .context("Failed to acquire connection from pool")?;

            match (self.protocol, conn) {
                (CommitProtocol::BulkCopy, PoolConnection::Postgres(mut conn)) => {
                    copy_batch(&mut conn, table, columns, rows).await
                }
                (CommitProtocol::MultiRowInsert, PoolConnection::Sqlite(mut conn)) => {
                    insert_batch(&mut conn, table, columns, rows).await
                }
                (protocol, _) => Err(anyhow!(
                    "{:?} is not available on a {} connection",
                    protocol,
                    self.pool.kind()
                )),
            }
        };

        tokio::time::timeout(QUERY_TIMEOUT, commit)
            .await
            .map_err(|_| {
                anyhow!(
                    "Batch commit timed out after {} seconds",
                    QUERY_TIMEOUT.as_secs()
                )
            })?
    }
}

async fn copy_batch(
    conn: &mut PgConnection,
    table: &str,
    columns: &[String],
    rows: &[Vec<CellValue>],
) -> Result<()> {
    let payload = copy_payload(rows)?;

    let mut tx = conn.begin().await?;
    let mut copy = tx.copy_in_raw(&copy_statement(table, columns)).await?;
    copy.send(payload).await?;
    copy.finish().await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_batch(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[String],
    rows: &[Vec<CellValue>],
) -> Result<()> {
    let mut tx = conn.begin().await?;
    for chunk in rows.chunks(rows_per_statement(columns.len())) {
        let sql = insert_statement(table, columns, chunk.len());
        let mut query = sqlx::query(&sql);
        for value in chunk.iter().flatten() {
            query = bind_sqlite_value(query, value);
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

fn bind_sqlite_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &CellValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        CellValue::Integer(v) => query.bind(*v),
        other => query.bind(other.to_sql_text()),
    }
}

fn copy_statement(table: &str, columns: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text, NULL '{}')",
        table,
        column_list(columns),
        COPY_NULL
    )
}

/// Rows per `INSERT` so one statement stays under SQLite's bind-parameter limit
fn rows_per_statement(column_count: usize) -> usize {
    (SQLITE_MAX_BIND_PARAMETERS / column_count.max(1)).max(1)
}

fn insert_statement(table: &str, columns: &[String], row_count: usize) -> String {
    let row = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        column_list(columns),
        vec![row.as_str(); row_count].join(", ")
    )
}

/// Serialize rows in the COPY text format
fn copy_payload(rows: &[Vec<CellValue>]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    for row in rows {
        writer
            .write_record(row.iter().map(copy_field))
            .context("Failed to serialize COPY payload")?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to serialize COPY payload: {}", e.error()))
}

fn copy_field(value: &CellValue) -> String {
    match value.to_sql_text() {
        None => COPY_NULL.to_string(),
        Some(text) => escape_copy_text(&text),
    }
}

fn escape_copy_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Entity, SqlType};
    use crate::coordination::checkpoint::MemoryCheckpointStore;
    use crate::coordination::orchestrator::LoadConfigBuilder;
    use crate::db::schema::init_schema;
    use chrono::NaiveDate;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const CONCEPT_ROWS: &str = "concept_id\tconcept_name\tvalid_start_date\n\
                                1\tAspirin\t20240101\n\
                                2\tIbuprofen\t20240102\n\
                                3\tParacetamol\t20240103\n\
                                4\tNaproxen\t20240104\n\
                                5\tDiclofenac\t20240105\n";

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::new(vec![
            Entity::new("concept")
                .column("concept_id", SqlType::Integer)
                .column("concept_name", SqlType::Varchar(255))
                .column("valid_start_date", SqlType::Date)
                .primary_key("xpk_concept", &["concept_id"]),
        ]))
    }

    fn write_file(dir: &Path, name: &str, contents: &str) -> SourceFile {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        SourceFile {
            path,
            file_name: name.to_string(),
            total_rows: contents.lines().count() as u64 - 1,
            entity: "concept".to_string(),
        }
    }

    struct Harness {
        pool: Pool,
        checkpoints: Arc<MemoryCheckpointStore>,
        committer: BatchCommitter,
        telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    }

    impl Harness {
        async fn new(flush_interval: usize, max_rows_per_file: Option<u64>) -> Self {
            let pool = Pool::sqlite_in_memory().await.unwrap();
            init_schema(&pool, catalog(), "main").await.unwrap();

            let config = LoadConfigBuilder::default()
                .vocabulary_dir("unused")
                .flush_interval(flush_interval)
                .max_rows_per_file(max_rows_per_file)
                .schema("main")
                .build()
                .unwrap();

            let checkpoints = Arc::new(MemoryCheckpointStore::new());
            let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
            let committer = BatchCommitter::new(
                pool.clone(),
                catalog(),
                checkpoints.clone(),
                &config,
                telemetry_tx,
            );
            Self {
                pool,
                checkpoints,
                committer,
                telemetry_rx,
            }
        }

        fn batch_sizes(&mut self) -> Vec<u64> {
            let mut sizes = Vec::new();
            while let Ok(event) = self.telemetry_rx.try_recv() {
                if let TelemetryEvent::BatchCommitted { rows, .. } = event {
                    sizes.push(rows);
                }
            }
            sizes
        }

        async fn concept_ids(&self) -> Vec<i64> {
            let PoolConnection::Sqlite(mut conn) = self.pool.acquire().await.unwrap() else {
                panic!("expected sqlite connection");
            };
            sqlx::query_as::<_, (i64,)>("SELECT concept_id FROM concept ORDER BY concept_id")
                .fetch_all(&mut *conn)
                .await
                .unwrap()
                .into_iter()
                .map(|(id,)| id)
                .collect()
        }
    }

    #[test]
    fn test_protocol_per_backend() {
        assert_eq!(
            CommitProtocol::for_backend(BackendKind::Postgres),
            CommitProtocol::BulkCopy
        );
        assert_eq!(
            CommitProtocol::for_backend(BackendKind::Sqlite),
            CommitProtocol::MultiRowInsert
        );
    }

    #[test]
    fn test_copy_payload() {
        let rows = vec![
            vec![
                CellValue::Integer(1),
                CellValue::Text("back\\slash".to_string()),
                CellValue::Null,
                CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()),
            ],
            vec![
                CellValue::Integer(2),
                CellValue::Text(String::new()),
                CellValue::Decimal("0.5".to_string()),
                CellValue::Null,
            ],
        ];
        let payload = String::from_utf8(copy_payload(&rows).unwrap()).unwrap();
        assert_eq!(
            payload,
            "1\tback\\\\slash\t\\N\t2024-01-31\n2\t\t0.5\t\\N\n"
        );
    }

    #[test]
    fn test_statements() {
        let columns = vec!["concept_id".to_string(), "concept_name".to_string()];
        assert_eq!(
            copy_statement("\"vocab\".\"concept\"", &columns),
            "COPY \"vocab\".\"concept\" (\"concept_id\", \"concept_name\") FROM STDIN WITH (FORMAT text, NULL '\\N')"
        );
        assert_eq!(
            insert_statement("\"concept\"", &columns, 2),
            "INSERT INTO \"concept\" (\"concept_id\", \"concept_name\") VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(rows_per_statement(10), SQLITE_MAX_BIND_PARAMETERS / 10);
        assert!(rows_per_statement(7) * 7 <= SQLITE_MAX_BIND_PARAMETERS);
        assert_eq!(rows_per_statement(0), SQLITE_MAX_BIND_PARAMETERS);
        assert_eq!(rows_per_statement(SQLITE_MAX_BIND_PARAMETERS * 2), 1);
    }

    #[tokio::test]
    async fn test_commits_full_batches_then_remainder() {
        let dir = TempDir::new().unwrap();
        let file = write_file(dir.path(), "CONCEPT.csv", CONCEPT_ROWS);
        let mut harness = Harness::new(2, None).await;

        let report = harness.committer.load_file(&file).await.unwrap();

        assert_eq!(harness.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(report.rows_committed, 5);
        assert_eq!(report.batches, 3);
        assert!(!report.skipped);
        assert_eq!(harness.concept_ids().await, vec![1, 2, 3, 4, 5]);

        let checkpoint = harness.checkpoints.get_or_create(&file).await.unwrap();
        assert_eq!(checkpoint.rows_committed, 5);
    }

    #[tokio::test]
    async fn test_resumes_after_committed_rows() {
        let dir = TempDir::new().unwrap();
        let file = write_file(dir.path(), "CONCEPT.csv", CONCEPT_ROWS);
        let mut harness = Harness::new(2, None).await;

        let mut checkpoint = harness.checkpoints.get_or_create(&file).await.unwrap();
        checkpoint.advance(2).unwrap();
        harness.checkpoints.save(&checkpoint).await.unwrap();

        let report = harness.committer.load_file(&file).await.unwrap();

        assert_eq!(report.resumed_from, 2);
        assert_eq!(report.rows_committed, 3);
        assert_eq!(harness.batch_sizes(), vec![2, 1]);
        assert_eq!(harness.concept_ids().await, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_skips_fully_loaded_file() {
        let dir = TempDir::new().unwrap();
        let file = write_file(dir.path(), "CONCEPT.csv", CONCEPT_ROWS);
        let mut harness = Harness::new(2, None).await;

        harness.committer.load_file(&file).await.unwrap();
        harness.batch_sizes();

        let report = harness.committer.load_file(&file).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.rows_committed, 0);
        assert!(harness.batch_sizes().is_empty());
        assert_eq!(harness.concept_ids().await.len(), 5);
    }

    #[tokio::test]
    async fn test_row_cap_bounds_file_position() {
        let dir = TempDir::new().unwrap();
        let file = write_file(dir.path(), "CONCEPT.csv", CONCEPT_ROWS);
        let mut harness = Harness::new(2, Some(3)).await;

        let report = harness.committer.load_file(&file).await.unwrap();
        assert_eq!(report.rows_committed, 3);
        assert_eq!(harness.batch_sizes(), vec![2, 1]);

        // the cap is reached from the checkpoint alone
        let report = harness.committer.load_file(&file).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.resumed_from, 3);
        assert_eq!(report.rows_committed, 0);
        assert_eq!(harness.concept_ids().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cast_failure_leaves_pending_batch_uncommitted() {
        let dir = TempDir::new().unwrap();
        let contents = "concept_id\tconcept_name\tvalid_start_date\n\
                        1\tAspirin\t20240101\n\
                        2\tIbuprofen\t20240102\n\
                        3\tParacetamol\t2024-01-03\n\
                        4\tNaproxen\t20240104\n";
        let file = write_file(dir.path(), "CONCEPT.csv", contents);
        let mut harness = Harness::new(2, None).await;

        let err = harness.committer.load_file(&file).await.unwrap_err();
        let cast = err.downcast_ref::<crate::error::LoaderError>().unwrap();
        assert!(matches!(
            cast,
            crate::error::LoaderError::Cast { line: 4, .. }
        ));

        assert_eq!(harness.batch_sizes(), vec![2]);
        assert_eq!(harness.concept_ids().await, vec![1, 2]);
        let checkpoint = harness.checkpoints.get_or_create(&file).await.unwrap();
        assert_eq!(checkpoint.rows_committed, 2);
    }

    #[tokio::test]
    async fn test_dates_are_stored_rewritten() {
        let dir = TempDir::new().unwrap();
        let file = write_file(dir.path(), "CONCEPT.csv", CONCEPT_ROWS);
        let harness = Harness::new(10, None).await;

        harness.committer.load_file(&file).await.unwrap();

        let PoolConnection::Sqlite(mut conn) = harness.pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (date,): (String,) =
            sqlx::query_as("SELECT valid_start_date FROM concept WHERE concept_id = 1")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(date, "2024-01-01");
    }
}
