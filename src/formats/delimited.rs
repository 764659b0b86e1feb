use anyhow::{Context, Result};
use csv::{ByteRecord, StringRecord};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::{FIELD_DELIMITER, READ_AHEAD_ROWS};

/// A single data row of an export file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based line number in the file (the header is line 1)
    pub line_number: u64,
    pub fields: Vec<String>,
}

/// Tab separated, no quoting, one header row. Rows with a field count that
/// differs from the header are returned as they are and rejected by the caster.
fn reader_builder() -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .delimiter(FIELD_DELIMITER)
        .quoting(false)
        .has_headers(true)
        .flexible(true);
    builder
}

/// Count the data rows of an export file, header excluded
///
/// Shares its reader configuration with `TsvReader` (blank lines are skipped by
/// both), so the count always equals the rows a full read yields.
pub async fn count_records(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut reader = reader_builder()
            .from_path(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut record = ByteRecord::new();
        let mut rows = 0u64;
        while reader
            .read_byte_record(&mut record)
            .with_context(|| format!("Failed to read {}", path.display()))?
        {
            rows += 1;
        }
        Ok(rows)
    })
    .await
    .context("Row count task failed")?
}

/// Reader for tab-delimited vocabulary exports with a single header row
///
/// Quotes carry no meaning. Parsing runs on the blocking pool in blocks of
/// `READ_AHEAD_ROWS` rows.
pub struct TsvReader {
    path: PathBuf,
    /// `None` once the end of the file has been reached
    reader: Option<csv::Reader<File>>,
    header: Vec<String>,
    buffered: VecDeque<Record>,
}

impl TsvReader {
    /// Open a file and consume its header row
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (reader, header) = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || -> Result<_> {
                let mut reader = reader_builder()
                    .from_path(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let header = reader
                    .headers()
                    .with_context(|| format!("Failed to read header of {}", path.display()))?
                    .iter()
                    .map(|name| name.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
                    .collect::<Vec<_>>();
                Ok((reader, header))
            })
            .await
            .context("Reader task failed")??
        };

        Ok(Self {
            path,
            reader: Some(reader),
            header,
            buffered: VecDeque::new(),
        })
    }

    /// Column names from the header row, trimmed and lowercased
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Skip up to `rows` data rows, returning how many were skipped
    pub async fn skip(&mut self, rows: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < rows {
            if self.buffered.is_empty() && !self.fill().await? {
                break;
            }
            let take = (rows - skipped).min(self.buffered.len() as u64);
            self.buffered.drain(..take as usize);
            skipped += take;
        }
        Ok(skipped)
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.buffered.is_empty() && !self.fill().await? {
            return Ok(None);
        }
        Ok(self.buffered.pop_front())
    }

    /// Parse the next block of rows, returning false at the end of the file
    async fn fill(&mut self) -> Result<bool> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(false);
        };

        let (reader, records) = tokio::task::spawn_blocking(move || {
            let records = read_block(&mut reader, READ_AHEAD_ROWS);
            (reader, records)
        })
        .await
        .context("Reader task failed")?;
        let records = records.with_context(|| format!("Failed to read {}", self.path.display()))?;

        if records.len() == READ_AHEAD_ROWS {
            self.reader = Some(reader);
        }
        let any = !records.is_empty();
        self.buffered.extend(records);
        Ok(any)
    }
}

fn read_block(reader: &mut csv::Reader<File>, max: usize) -> csv::Result<Vec<Record>> {
    let mut records = Vec::with_capacity(max);
    let mut record = StringRecord::new();
    while records.len() < max && reader.read_record(&mut record)? {
        records.push(Record {
            line_number: record.position().map_or(0, |p| p.line()),
            fields: record.iter().map(str::to_string).collect(),
        });
    }
    Ok(records)
}
