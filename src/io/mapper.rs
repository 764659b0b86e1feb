//! Maps vocabulary export files onto catalog entities
//!
//! `CONCEPT_RELATIONSHIP.csv` feeds `concept_relationship`: the file stem is
//! lowercased and `-`/space become `_`. Files whose stem names no entity can be
//! mapped explicitly through the override table.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::{DEFAULT_FILE_TABLE_OVERRIDES, VOCABULARY_FILE_EXTENSION};
use crate::error::LoaderError;
use crate::formats::delimited::count_records;

/// A discovered export file with a resolved target entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    /// Data rows, header excluded
    pub total_rows: u64,
    pub entity: String,
}

/// Result of scanning a vocabulary directory
#[derive(Debug, Default)]
pub struct Discovery {
    /// Resolved files, ordered by file name
    pub files: Vec<SourceFile>,
    /// Names of files that matched no entity
    pub unresolved: Vec<String>,
}

pub struct FileMapper {
    catalog: Arc<Catalog>,
    overrides: HashMap<String, String>,
}

impl FileMapper {
    /// Build a mapper; `overrides` (file stem -> table) take precedence over the
    /// built-in ones.
    pub fn new(catalog: Arc<Catalog>, overrides: &HashMap<String, String>) -> Self {
        let overrides = DEFAULT_FILE_TABLE_OVERRIDES
            .iter()
            .map(|(stem, table)| (normalize_name(stem), table.to_string()))
            .chain(
                overrides
                    .iter()
                    .map(|(stem, table)| (normalize_name(stem), table.clone())),
            )
            .collect();

        Self { catalog, overrides }
    }

    /// Target entity for a file, if any
    pub fn resolve(&self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let normalized = normalize_name(stem);
        let table = self.overrides.get(&normalized).unwrap_or(&normalized);

        self.catalog
            .entities()
            .iter()
            .find(|e| normalize_name(&e.table) == normalize_name(table))
            .map(|e| e.table.clone())
    }

    /// List the export files of `dir` and resolve each one
    ///
    /// Unresolvable files are logged and reported, never fatal.
    pub async fn discover(&self, dir: &Path) -> Result<Discovery> {
        if !tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(LoaderError::MissingDirectory {
                path: dir.to_path_buf(),
            }
            .into());
        }

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let has_extension = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(VOCABULARY_FILE_EXTENSION));
            if is_file && has_extension {
                paths.push(path);
            }
        }
        paths.sort();

        let mut discovery = Discovery::default();
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let Some(entity) = self.resolve(&path) else {
                warn!(
                    file = %file_name,
                    "Can not determine table for vocabulary file, skipping. Use a file mapping to assign it to a table."
                );
                discovery.unresolved.push(file_name);
                continue;
            };

            let total_rows = count_records(&path).await?;
            debug!(file = %file_name, entity = %entity, total_rows, "mapped vocabulary file");

            discovery.files.push(SourceFile {
                path,
                file_name,
                total_rows,
                entity,
            });
        }

        Ok(discovery)
    }
}

/// Case-insensitive, underscore-normalized form of a file stem or table name
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}
