//! Error conditions callers need to tell apart
//!
//! Everything else travels as a plain `anyhow::Error` with context attached.
//! These variants are wrapped in `anyhow::Error` as well and can be recovered
//! with `err.downcast_ref::<LoaderError>()`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(
        "Unsupported database backend '{kind}'. Supported backends: postgres (postgres://...), sqlite (sqlite:...)"
    )]
    UnsupportedBackend { kind: String },

    #[error(
        "Cannot cast value in {file}:{line}, column '{column}'.\n\
         - Got: '{value}'\n\
         - Error: {reason}"
    )]
    Cast {
        file: String,
        line: u64,
        column: String,
        value: String,
        reason: String,
    },

    #[error("Column '{column}' in the header of {file} does not exist in table '{entity}'")]
    HeaderMismatch {
        file: String,
        column: String,
        entity: String,
    },

    #[error("{file}:{line} has {found} field(s), the header declares {expected}")]
    FieldCount {
        file: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Checkpoint for {file} would reach {committed} rows but the file only has {total}")]
    CheckpointOverflow {
        file: String,
        committed: u64,
        total: u64,
    },

    #[error("Failed to restore {} constraint(s):\n{}", failures.len(), failures.join("\n"))]
    ConstraintRestore { failures: Vec<String> },

    #[error("Vocabulary directory '{}' does not exist or is not a directory", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("Load interrupted")]
    Interrupted,
}
