//! High-level runner API for the vocabulary loader.
//!
//! This module provides a simplified public interface that encapsulates all the
//! internal complexity of setting up connections, checkpoint storage, constraint
//! handling and the load orchestrator.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::{DEFAULT_FLUSH_INTERVAL, DEFAULT_SCHEMA};
use crate::coordination::{CheckpointStore, LoadConfigBuilder, Orchestrator, TableCheckpointStore};
use crate::db::{self, BackendKind, ConstraintManager, Pool};
use crate::io::FileMapper;

pub use crate::coordination::{FileReport, LoadResult};

/// Arguments for running a vocabulary load
#[derive(Debug, Clone)]
pub struct LoadArgs {
    // Connection configuration
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    /// Postgres namespace of the vocabulary tables (ignored by SQLite)
    pub schema: String,

    // Source configuration
    pub vocabulary_dir: PathBuf,
    /// File stem -> table name, for files whose name is not a table name
    pub file_overrides: HashMap<String, String>,

    // Load behaviour
    pub flush_interval: usize,
    pub suspend_constraints: bool,
    pub restore_constraints: bool,
    pub truncate_tables: bool,
    pub max_rows_per_file: Option<u64>,
    pub checkpointing: bool,

    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<Pool>,
}

impl LoadArgs {
    /// Arguments with the default load behaviour
    pub fn new(database_url: impl Into<String>, vocabulary_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            vocabulary_dir: vocabulary_dir.into(),
            file_overrides: HashMap::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            suspend_constraints: true,
            restore_constraints: true,
            truncate_tables: false,
            max_rows_per_file: None,
            checkpointing: true,
            quiet: false,
            #[cfg(test)]
            test_pool: None,
        }
    }
}

/// A file a load would process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub file_name: String,
    pub table: String,
    pub total_rows: u64,
}

/// What a load would do, computed without touching the database
#[derive(Debug, Clone, Serialize)]
pub struct LoadPlan {
    pub backend: String,
    pub files: Vec<PlannedFile>,
    pub unresolved_files: Vec<String>,
}

/// Run a vocabulary load, stopping early on Ctrl-C
///
/// This is the main entry point for loading vocabulary exports. It handles all
/// the internal setup including:
/// - Resolving the backend from the URL and creating the connection pool
/// - Creating the checkpoint table
/// - Suspending and restoring constraints around the load
/// - Tracking progress
///
/// # Example
///
/// ```no_run
/// use omop_vocab_loader::runner::{LoadArgs, run_load};
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut args = LoadArgs::new("postgres://omop@localhost/omop", "/data/vocabulary");
/// args.schema = "vocab".to_string();
/// args.flush_interval = 10_000;
///
/// let result = run_load(args).await?;
/// println!("Loaded {} rows in {:?}", result.rows_committed, result.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_load(args: LoadArgs) -> Result<LoadResult> {
    run_load_until(args, ctrl_c()).await
}

/// Run a vocabulary load that is interrupted when `shutdown` resolves
///
/// Interruption fails the load with `LoaderError::Interrupted` after the
/// constraints have been restored.
pub async fn run_load_until<F>(args: LoadArgs, shutdown: F) -> Result<LoadResult>
where
    F: Future<Output = ()>,
{
    // Rejects unsupported backends before any file is opened
    let kind = BackendKind::from_url(&args.database_url)?;

    #[cfg(test)]
    let pool = match args.test_pool {
        Some(test_pool) => test_pool,
        None => Pool::connect(&args.database_url).await?,
    };

    #[cfg(not(test))]
    let pool = Pool::connect(&args.database_url).await?;

    info!(backend = %kind, schema = %args.schema, "Connected");

    let config = LoadConfigBuilder::default()
        .vocabulary_dir(args.vocabulary_dir)
        .flush_interval(args.flush_interval)
        .suspend_constraints(args.suspend_constraints)
        .restore_constraints(args.restore_constraints)
        .truncate_tables(args.truncate_tables)
        .max_rows_per_file(args.max_rows_per_file)
        .checkpointing(args.checkpointing)
        .schema(args.schema)
        .file_overrides(args.file_overrides)
        .quiet(args.quiet)
        .build()?;

    let orchestrator = Orchestrator::new(pool, Arc::new(Catalog::vocabulary()));
    orchestrator.run_load(config, shutdown).await
}

/// Map the vocabulary directory without connecting to the database
pub async fn plan_load(args: &LoadArgs) -> Result<LoadPlan> {
    let kind = BackendKind::from_url(&args.database_url)?;
    let mapper = FileMapper::new(Arc::new(Catalog::vocabulary()), &args.file_overrides);
    let discovery = mapper.discover(&args.vocabulary_dir).await?;

    Ok(LoadPlan {
        backend: kind.to_string(),
        files: discovery
            .files
            .into_iter()
            .map(|f| PlannedFile {
                file_name: f.file_name,
                table: f.entity,
                total_rows: f.total_rows,
            })
            .collect(),
        unresolved_files: discovery.unresolved,
    })
}

/// Forget all load progress by dropping the checkpoint table
pub async fn reset_state(database_url: &str, schema: &str) -> Result<()> {
    let pool = Pool::connect(database_url).await?;
    let result = reset_state_on(&pool, schema).await;
    pool.close().await;
    result
}

pub(crate) async fn reset_state_on(pool: &Pool, schema: &str) -> Result<()> {
    TableCheckpointStore::new(pool.clone(), schema)
        .drop_table()
        .await?;
    info!(schema, "Load state reset");
    Ok(())
}

/// Recreate every declared constraint of the vocabulary tables
///
/// On SQLite the foreign key switch is per connection, so this only affects
/// the connection opened here.
pub async fn restore_constraints(database_url: &str, schema: &str) -> Result<()> {
    let pool = Pool::connect(database_url).await?;
    let result = ConstraintManager::new(pool.clone(), Arc::new(Catalog::vocabulary()), schema)
        .restore_declared()
        .await;
    pool.close().await;
    result
}

/// Create the vocabulary tables (and their constraints) that do not exist yet
pub async fn init_schema(database_url: &str, schema: &str) -> Result<()> {
    let pool = Pool::connect(database_url).await?;
    let result = init_schema_on(&pool, schema).await;
    pool.close().await;
    result
}

pub(crate) async fn init_schema_on(pool: &Pool, schema: &str) -> Result<()> {
    db::schema::init_schema(pool, Arc::new(Catalog::vocabulary()), schema).await
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available, never interrupt
        std::future::pending::<()>().await;
    }
}
