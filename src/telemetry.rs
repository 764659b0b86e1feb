/// Telemetry events sent from the batch committer to the progress display
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Committer started streaming a file
    FileStarted {
        file_name: String,
        total_rows: u64,
        resumed_from: u64,
    },
    /// Batch of rows was committed and checkpointed
    BatchCommitted { rows: u64, duration_ms: u64 },
    /// File was already fully loaded by an earlier run
    FileSkipped { file_name: String, total_rows: u64 },
    /// Committer reached the end of a file (or its row cap)
    FileCompleted { file_name: String },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub files_started: usize,
    pub files_completed: usize,
    pub files_skipped: usize,
    /// Rows committed by this run
    pub rows_committed: u64,
    /// Rows covered by files started or skipped, including already committed ones
    pub rows_seen: u64,
    pub current_file: Option<String>,
    /// Data rows of `current_file`
    pub current_file_rows: u64,
    /// Last file that was completed or skipped
    pub last_finished: Option<String>,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileStarted {
                file_name,
                total_rows,
                resumed_from,
            } => {
                self.files_started += 1;
                self.rows_seen += resumed_from;
                self.current_file = Some(file_name.clone());
                self.current_file_rows = *total_rows;
            }
            TelemetryEvent::BatchCommitted { rows, duration_ms } => {
                self.rows_committed += rows;
                self.rows_seen += rows;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::FileSkipped {
                file_name,
                total_rows,
            } => {
                self.files_skipped += 1;
                self.rows_seen += total_rows;
                self.last_finished = Some(format!("{} already loaded", file_name));
            }
            TelemetryEvent::FileCompleted { file_name } => {
                self.files_completed += 1;
                self.current_file = None;
                self.last_finished = Some(format!("{} done", file_name));
            }
        }
    }

    /// Message for the file progress bar
    pub fn file_message(&self) -> String {
        match &self.current_file {
            Some(file) => format!("{} ({} rows)", file, self.current_file_rows),
            None => self.last_finished.clone().unwrap_or_default(),
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
