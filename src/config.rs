//! Configuration constants for the vocabulary loader
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub const PG_MIN_IDLE: u32 = 1;

/// The loader only ever holds one connection at a time, the second one is
/// headroom for the checkpoint writes issued between batches.
pub const PG_MAX_POOL_SIZE: u32 = 4;

// ============================================================================
// Loader Configuration
// ============================================================================

/// Number of parsed rows kept in memory before they are committed
///
/// Set to 20k rows: vocabulary rows are small (a few hundred bytes), so a batch
/// stays well below 10 MB while amortizing the per-COPY and per-transaction
/// overhead across enough rows to keep the database busy.
pub const DEFAULT_FLUSH_INTERVAL: usize = 20_000;

/// Timeout for a single batch commit or DDL statement
///
/// Rebuilding an index on `concept_relationship` after a full load can take
/// several minutes, hence the generous value.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1800); // 30 minutes

/// Table holding one checkpoint row per (file name, file row count)
pub const CHECKPOINT_TABLE: &str = "_vocabulary_loader_state";

pub const DEFAULT_SCHEMA: &str = "public";

/// SQLite refuses statements with more bind parameters than this
/// (`SQLITE_MAX_VARIABLE_NUMBER` since 3.32).
pub const SQLITE_MAX_BIND_PARAMETERS: usize = 32_766;

// ============================================================================
// Source File Configuration
// ============================================================================

/// Athena exports carry a `.csv` extension even though they are tab separated
pub const VOCABULARY_FILE_EXTENSION: &str = "csv";

pub const FIELD_DELIMITER: u8 = b'\t';

/// Date format used by the export files (`20240131`)
pub const SOURCE_DATE_FORMAT: &str = "%Y%m%d";

/// Date format handed to the database (`2024-01-31`)
pub const TARGET_DATE_FORMAT: &str = "%Y-%m-%d";

/// Rows parsed per blocking read of a source file
///
/// Keeps the hand-offs to the blocking pool rare on multi-gigabyte exports like
/// CONCEPT_RELATIONSHIP.csv without holding much memory.
pub const READ_AHEAD_ROWS: usize = 4096;

/// Files whose stem does not name a table, mapped to the table they feed
pub const DEFAULT_FILE_TABLE_OVERRIDES: &[(&str, &str)] = &[("CONCEPT_CPT4", "concept")];
