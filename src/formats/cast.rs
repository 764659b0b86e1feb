//! Casting of raw text cells to the declared column types
//!
//! Every cell is converted before its row is buffered, so a malformed value
//! aborts the load before the batch holding it is committed.

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

use super::delimited::Record;
use crate::catalog::{Column, Entity, SqlType};
use crate::config::{SOURCE_DATE_FORMAT, TARGET_DATE_FORMAT};
use crate::error::LoaderError;

/// A cell converted to its column's type
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    /// Validated numeric literal, kept as text to preserve its precision
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    /// Textual form handed to the database, `None` for NULL
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Integer(v) => write!(f, "{}", v),
            CellValue::Decimal(v) | CellValue::Text(v) => f.write_str(v),
            CellValue::Date(d) => write!(f, "{}", d.format(TARGET_DATE_FORMAT)),
            CellValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Parse an export date (`20240131`); `CellValue::Date` renders it as `2024-01-31`
fn parse_source_date(value: &str) -> Result<NaiveDate, String> {
    let value = value.trim();
    // chrono accepts fewer digits per field, the exports always use 8
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!(
            "expected an 8-digit date in {} format",
            SOURCE_DATE_FORMAT
        ));
    }
    NaiveDate::parse_from_str(value, SOURCE_DATE_FORMAT).map_err(|e| e.to_string())
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| parse_source_date(value).map(|d| d.and_time(chrono::NaiveTime::MIN)))
        .map_err(|_| "expected a timestamp like '2024-01-31 12:00:00'".to_string())
}

/// Cast one cell for `column`
fn cast_value(column: &Column, raw: &str) -> Result<CellValue, String> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return if column.nullable {
            Ok(CellValue::Null)
        } else if column.sql_type.is_textual() {
            Ok(CellValue::Text(raw.to_string()))
        } else {
            Err("empty value for a NOT NULL column".to_string())
        };
    }

    match column.sql_type {
        SqlType::Integer => {
            let value: i64 = trimmed.parse().map_err(|e| format!("{}", e))?;
            i32::try_from(value)
                .map(|_| CellValue::Integer(value))
                .map_err(|_| "out of range for INTEGER".to_string())
        }
        SqlType::BigInt => trimmed
            .parse::<i64>()
            .map(CellValue::Integer)
            .map_err(|e| e.to_string()),
        SqlType::Numeric => trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|_| CellValue::Decimal(trimmed.to_string()))
            .ok_or_else(|| "not a numeric value".to_string()),
        SqlType::Date => parse_source_date(trimmed).map(CellValue::Date),
        SqlType::Timestamp => parse_timestamp(trimmed).map(CellValue::Timestamp),
        SqlType::Varchar(_) | SqlType::Text => Ok(CellValue::Text(raw.to_string())),
    }
}

/// Casts the records of one file, aligned to the file's header order
#[derive(Debug, Clone)]
pub struct RowCaster {
    file: String,
    columns: Vec<Column>,
}

impl RowCaster {
    /// Align `header` with the columns of `entity`
    ///
    /// The header order is kept: it is also the column order of every insert.
    pub fn new(file: &str, entity: &Entity, header: &[String]) -> Result<Self, LoaderError> {
        let columns = header
            .iter()
            .map(|name| {
                entity
                    .find_column(name)
                    .cloned()
                    .ok_or_else(|| LoaderError::HeaderMismatch {
                        file: file.to_string(),
                        column: name.clone(),
                        entity: entity.table.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            file: file.to_string(),
            columns,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn cast(&self, record: &Record) -> Result<Vec<CellValue>, LoaderError> {
        if record.fields.len() != self.columns.len() {
            return Err(LoaderError::FieldCount {
                file: self.file.clone(),
                line: record.line_number,
                expected: self.columns.len(),
                found: record.fields.len(),
            });
        }

        self.columns
            .iter()
            .zip(&record.fields)
            .map(|(column, raw)| {
                cast_value(column, raw).map_err(|reason| LoaderError::Cast {
                    file: self.file.clone(),
                    line: record.line_number,
                    column: column.name.clone(),
                    value: raw.clone(),
                    reason,
                })
            })
            .collect()
    }
}
