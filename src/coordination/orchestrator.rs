use anyhow::Result;
use derive_builder::Builder;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::checkpoint::{CheckpointStore, MemoryCheckpointStore, TableCheckpointStore};
use super::committer::{BatchCommitter, FileReport};
use crate::catalog::Catalog;
use crate::config::{DEFAULT_FLUSH_INTERVAL, DEFAULT_SCHEMA};
use crate::db::schema::truncate_table;
use crate::db::{ConstraintManager, ConstraintSnapshot, Pool};
use crate::error::LoaderError;
use crate::io::{FileMapper, SourceFile};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for a vocabulary load
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct LoadConfig {
    pub vocabulary_dir: PathBuf,
    /// Rows per committed batch
    #[builder(default = "DEFAULT_FLUSH_INTERVAL")]
    pub flush_interval: usize,
    #[builder(default = "true")]
    pub suspend_constraints: bool,
    #[builder(default = "true")]
    pub restore_constraints: bool,
    #[builder(default)]
    pub truncate_tables: bool,
    /// Only rows at positions below the cap are loaded
    #[builder(default)]
    pub max_rows_per_file: Option<u64>,
    #[builder(default = "true")]
    pub checkpointing: bool,
    #[builder(default = "DEFAULT_SCHEMA.to_string()")]
    pub schema: String,
    /// File stem -> table name, on top of the built-in overrides
    #[builder(default)]
    pub file_overrides: HashMap<String, String>,
    #[builder(default)]
    pub quiet: bool,
}

impl LoadConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.flush_interval == Some(0) {
            return Err("flush_interval must be at least 1".to_string());
        }
        if self.max_rows_per_file == Some(Some(0)) {
            return Err("max_rows_per_file must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Result of a completed vocabulary load
#[derive(Debug, Serialize)]
pub struct LoadResult {
    pub run_id: String,
    /// Files with at least one row read by this run
    pub files_loaded: usize,
    /// Files the checkpoint showed as fully loaded
    pub files_skipped: usize,
    /// Files that matched no table
    pub unresolved_files: Vec<String>,
    pub rows_committed: u64,
    pub batches_committed: u64,
    pub duration: Duration,
    pub files: Vec<FileReport>,
}

/// Where a run stands with respect to the schema's constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadPhase {
    Idle,
    ConstraintsSuspended,
    PerFileLoading,
    ConstraintsRestored,
    Done,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::ConstraintsSuspended => "constraints-suspended",
            LoadPhase::PerFileLoading => "loading",
            LoadPhase::ConstraintsRestored => "constraints-restored",
            LoadPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Drives a full run: suspend constraints, load every file, restore constraints
pub struct Orchestrator {
    pool: Pool,
    catalog: Arc<Catalog>,
}

impl Orchestrator {
    pub fn new(pool: Pool, catalog: Arc<Catalog>) -> Self {
        Self { pool, catalog }
    }

    /// Run a complete load
    ///
    /// Once constraints are suspended they are restored on every exit path:
    /// success, a failing file, or `shutdown` resolving mid-run. `shutdown` is
    /// watched from the start of the suspension; resolving during it lets the
    /// suspension finish, then skips loading. A load error takes precedence
    /// over a restore error; the latter is then only logged.
    pub async fn run_load<F>(&self, config: LoadConfig, shutdown: F) -> Result<LoadResult>
    where
        F: Future<Output = ()>,
    {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!(phase = %LoadPhase::Idle, run_id = %run_id, dir = %config.vocabulary_dir.display(), "Starting vocabulary load");
        tokio::pin!(shutdown);

        let mapper = FileMapper::new(Arc::clone(&self.catalog), &config.file_overrides);
        let discovery = mapper.discover(&config.vocabulary_dir).await?;
        info!(
            files = discovery.files.len(),
            unresolved = discovery.unresolved.len(),
            "Discovered vocabulary files"
        );

        let checkpoints = self.checkpoint_store(&config).await?;

        let manager = ConstraintManager::new(
            self.pool.clone(),
            Arc::clone(&self.catalog),
            config.schema.clone(),
        );
        let mut interrupted = false;
        let snapshot = if config.suspend_constraints {
            let suspend = Self::suspend(&manager);
            tokio::pin!(suspend);
            let snapshot = tokio::select! {
                biased;
                result = &mut suspend => result?,
                _ = &mut shutdown => {
                    warn!("Interrupted while suspending constraints, finishing the suspension first");
                    interrupted = true;
                    suspend.as_mut().await?
                }
            };
            Some(snapshot)
        } else {
            None
        };

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let prog_jh = Self::setup_progress_tracking(&config, &discovery.files, telemetry_rx);

        let committer = BatchCommitter::new(
            self.pool.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&checkpoints),
            &config,
            telemetry_tx,
        );
        info!(phase = %LoadPhase::PerFileLoading, protocol = ?committer.protocol(), "Loading files");

        let outcome = if interrupted {
            Err(LoaderError::Interrupted.into())
        } else {
            tokio::select! {
                result = self.load_files(&committer, checkpoints.as_ref(), &discovery.files, &config) => result,
                _ = &mut shutdown => {
                    warn!("Interrupted, stopping load");
                    Err(LoaderError::Interrupted.into())
                }
            }
        };

        // Closes the telemetry channel
        drop(committer);
        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        let restored = match &snapshot {
            Some(snapshot) if config.restore_constraints => {
                let restored = manager.restore(snapshot).await;
                if restored.is_ok() {
                    info!(phase = %LoadPhase::ConstraintsRestored, "Constraints restored");
                }
                restored
            }
            Some(_) => {
                warn!("Constraints were left suspended, run restore-constraints once the data is complete");
                Ok(())
            }
            None => Ok(()),
        };

        let reports = match (outcome, restored) {
            (Ok(reports), Ok(())) => reports,
            (Ok(_), Err(restore_err)) => return Err(restore_err),
            (Err(load_err), Err(restore_err)) => {
                warn!(error = %format!("{:#}", restore_err), "Failed to restore constraints after a failed load");
                return Err(load_err);
            }
            (Err(load_err), Ok(())) => return Err(load_err),
        };

        let result = LoadResult {
            run_id,
            files_loaded: reports.iter().filter(|r| !r.skipped).count(),
            files_skipped: reports.iter().filter(|r| r.skipped).count(),
            unresolved_files: discovery.unresolved,
            rows_committed: reports.iter().map(|r| r.rows_committed).sum(),
            batches_committed: reports.iter().map(|r| r.batches).sum(),
            duration: start_time.elapsed(),
            files: reports,
        };

        info!(
            phase = %LoadPhase::Done,
            files_loaded = result.files_loaded,
            files_skipped = result.files_skipped,
            rows = result.rows_committed,
            "Load complete in {:.2}s",
            result.duration.as_secs_f64()
        );

        Ok(result)
    }

    async fn checkpoint_store(&self, config: &LoadConfig) -> Result<Arc<dyn CheckpointStore>> {
        if !config.checkpointing {
            info!("Checkpointing disabled, every file starts from its first row");
            return Ok(Arc::new(MemoryCheckpointStore::new()));
        }

        let store = TableCheckpointStore::new(self.pool.clone(), &config.schema);
        store.ensure_table().await?;
        Ok(Arc::new(store))
    }

    /// Suspend constraints; a failing suspension has already put back what it dropped
    async fn suspend(manager: &ConstraintManager) -> Result<ConstraintSnapshot> {
        let snapshot = manager.suspend().await?;
        info!(phase = %LoadPhase::ConstraintsSuspended, "Constraints suspended");
        Ok(snapshot)
    }

    /// Load files in order, truncating each target table before its first file
    async fn load_files(
        &self,
        committer: &BatchCommitter,
        checkpoints: &dyn CheckpointStore,
        files: &[SourceFile],
        config: &LoadConfig,
    ) -> Result<Vec<FileReport>> {
        let mut truncated = HashSet::new();
        let mut reports = Vec::with_capacity(files.len());

        for file in files {
            if config.truncate_tables && truncated.insert(file.entity.clone()) {
                truncate_table(&self.pool, &config.schema, &file.entity).await?;
                checkpoints.reset_for_entity(&file.entity).await?;
            }
            reports.push(committer.load_file(file).await?);
        }

        Ok(reports)
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        config: &LoadConfig,
        files: &[SourceFile],
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if config.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();
        let total_rows: u64 = files.iter().map(|f| f.total_rows).sum();

        let file_bar = multi_progress.add(ProgressBar::new(files.len() as u64));
        file_bar.set_style(bar_style(
            "[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ));

        let rows_bar = multi_progress.add(ProgressBar::new(total_rows));
        rows_bar.set_style(bar_style(
            "[{elapsed_precise}] Rows:  [{bar:30.green/blue}] {human_pos}/{human_len} ({percent}%) | {per_sec}",
        ));

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(bar_style("[{elapsed_precise}] Batch Time: {msg}"));

        Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                file_bar.set_position((stats.files_completed + stats.files_skipped) as u64);
                file_bar.set_message(stats.file_message());
                rows_bar.set_position(stats.rows_seen);

                let (p50, p90, p99) = stats.get_percentiles();
                if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                    stats_bar
                        .set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }

            file_bar.finish_with_message("");
            rows_bar.finish();

            let (p50, p90, p99) = stats.get_percentiles();
            if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                stats_bar
                    .finish_with_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            } else {
                stats_bar.finish();
            }
        }))
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
