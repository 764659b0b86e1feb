//! Schema catalog - tables, column types and constraint declarations the loader works against
//!
//! The catalog is static: it describes the target schema, it never reads it
//! back from the database. The constraint manager drops and recreates exactly
//! what is declared here.

mod vocabulary;

use serde::{Deserialize, Serialize};

/// SQL data type of a catalog column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    BigInt,
    Numeric,
    Varchar(u32),
    Text,
    Date,
    Timestamp,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(&self) -> String {
        match self {
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Numeric => "NUMERIC".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
        }
    }

    /// Returns the SQLite type name (SQLite only cares about the affinity)
    pub fn to_sqlite(&self) -> &'static str {
        match self {
            SqlType::Integer | SqlType::BigInt => "INTEGER",
            SqlType::Numeric => "NUMERIC",
            SqlType::Varchar(_) | SqlType::Text => "TEXT",
            // Stored as ISO-8601 text, which is what SQLite's date functions expect
            SqlType::Date | SqlType::Timestamp => "TEXT",
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, SqlType::Varchar(_) | SqlType::Text)
    }
}

/// A column of a catalog entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

/// One table of the target schema with its declared constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub table: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKey>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<Index>,
}

impl Entity {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, sql_type: SqlType) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            sql_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: &str, sql_type: SqlType) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            sql_type,
            nullable: true,
        });
        self
    }

    pub fn primary_key(mut self, name: &str, columns: &[&str]) -> Self {
        self.primary_key = Some(PrimaryKey {
            name: name.to_string(),
            columns: to_owned(columns),
        });
        self
    }

    pub fn foreign_key(
        mut self,
        name: &str,
        columns: &[&str],
        referenced_table: &str,
        referenced_columns: &[&str],
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            name: name.to_string(),
            columns: to_owned(columns),
            referenced_table: referenced_table.to_string(),
            referenced_columns: to_owned(referenced_columns),
        });
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str]) -> Self {
        self.indexes.push(Index {
            name: name.to_string(),
            columns: to_owned(columns),
        });
        self
    }

    /// Look up a column by its exact name
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

fn to_owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// The set of entities the loader knows about
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entities: Vec<Entity>,
}

impl Catalog {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    /// OMOP CDM v5.4 standardized vocabulary tables
    pub fn vocabulary() -> Self {
        Self::new(vocabulary::entities())
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, table: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.table == table)
    }
}
