//! Suspension and restoration of primary keys, foreign keys and indexes
//!
//! The vocabulary tables reference each other in cycles (`concept.domain_id`
//! points at `domain`, `domain.domain_concept_id` points back at `concept`), so
//! no insertion order satisfies every constraint. The loader lifts enforcement
//! for the duration of a run and puts it back afterwards.
//!
//! Postgres gets structural DDL: everything the catalog declares is dropped and
//! later recreated. Foreign keys of other tables that reference a catalog table
//! are read from `pg_constraint`, dropped with it and recreated from their
//! recorded definition. SQLite cannot alter constraints after `CREATE TABLE`, so
//! there the manager flips `PRAGMA foreign_keys` and later restores its prior
//! value.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::pool::{BackendKind, Pool, PoolConnection, quote_ident};
use crate::catalog::{Catalog, Entity, ForeignKey, Index, PrimaryKey};
use crate::error::LoaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Index,
}

/// One DDL statement acting on one named constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintStatement {
    pub kind: ConstraintKind,
    /// Schema of `table`
    pub schema: String,
    pub table: String,
    pub name: String,
    pub sql: String,
}

/// A foreign key the catalog does not declare that references a catalog table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalForeignKey {
    pub schema: String,
    pub table: String,
    pub name: String,
    /// `pg_get_constraintdef` output, e.g. `FOREIGN KEY (x) REFERENCES concept(concept_id)`
    pub definition: String,
}

/// What `suspend()` changed, handed back to `restore()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintSnapshot {
    /// Constraints that were dropped
    Structural {
        /// Catalog constraints, in catalog order
        constraints: Vec<(ConstraintKind, String)>,
        external_foreign_keys: Vec<ExternalForeignKey>,
    },
    /// Value of `PRAGMA foreign_keys` before it was switched off
    ForeignKeySwitch { previously_enabled: bool },
}

/// Statements dropping every declared constraint: all indexes, then all
/// foreign keys, then all primary keys. Each tolerates an absent target.
///
/// Nothing cascades: a primary key that an undeclared foreign key still
/// depends on fails to drop instead of silently taking that key with it.
pub fn suspend_plan(catalog: &Catalog, schema: &str) -> Vec<ConstraintStatement> {
    let kind = BackendKind::Postgres;
    let mut plan = Vec::new();

    for entity in catalog.entities() {
        for index in &entity.indexes {
            plan.push(ConstraintStatement {
                kind: ConstraintKind::Index,
                schema: schema.to_string(),
                table: entity.table.clone(),
                name: index.name.clone(),
                sql: format!(
                    "DROP INDEX IF EXISTS {}",
                    kind.qualified_name(schema, &index.name)
                ),
            });
        }
    }

    for entity in catalog.entities() {
        for fk in &entity.foreign_keys {
            plan.push(drop_constraint(
                ConstraintKind::ForeignKey,
                schema,
                entity,
                &fk.name,
            ));
        }
    }

    for entity in catalog.entities() {
        if let Some(pk) = &entity.primary_key {
            plan.push(drop_constraint(
                ConstraintKind::PrimaryKey,
                schema,
                entity,
                &pk.name,
            ));
        }
    }

    plan
}

/// Statements recreating every declared constraint: all primary keys, then all
/// indexes, then all foreign keys. Foreign keys go last because a cycle can only
/// be closed once every referenced primary key exists.
pub fn restore_plan(catalog: &Catalog, schema: &str) -> Vec<ConstraintStatement> {
    let mut plan = Vec::new();

    for entity in catalog.entities() {
        if let Some(pk) = &entity.primary_key {
            plan.push(add_primary_key(schema, entity, pk));
        }
    }

    for entity in catalog.entities() {
        for index in &entity.indexes {
            plan.push(create_index(schema, entity, index));
        }
    }

    for entity in catalog.entities() {
        for fk in &entity.foreign_keys {
            plan.push(add_foreign_key(schema, entity, fk));
        }
    }

    plan
}

fn drop_constraint(
    kind: ConstraintKind,
    schema: &str,
    entity: &Entity,
    name: &str,
) -> ConstraintStatement {
    ConstraintStatement {
        kind,
        schema: schema.to_string(),
        table: entity.table.clone(),
        name: name.to_string(),
        sql: format!(
            "ALTER TABLE IF EXISTS {} DROP CONSTRAINT IF EXISTS {}",
            BackendKind::Postgres.qualified_name(schema, &entity.table),
            quote_ident(name)
        ),
    }
}

fn drop_external_foreign_key(fk: &ExternalForeignKey) -> ConstraintStatement {
    ConstraintStatement {
        kind: ConstraintKind::ForeignKey,
        schema: fk.schema.clone(),
        table: fk.table.clone(),
        name: fk.name.clone(),
        sql: format!(
            "ALTER TABLE IF EXISTS {} DROP CONSTRAINT IF EXISTS {}",
            BackendKind::Postgres.qualified_name(&fk.schema, &fk.table),
            quote_ident(&fk.name)
        ),
    }
}

fn add_external_foreign_key(fk: &ExternalForeignKey) -> ConstraintStatement {
    ConstraintStatement {
        kind: ConstraintKind::ForeignKey,
        schema: fk.schema.clone(),
        table: fk.table.clone(),
        name: fk.name.clone(),
        sql: format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            BackendKind::Postgres.qualified_name(&fk.schema, &fk.table),
            quote_ident(&fk.name),
            fk.definition
        ),
    }
}

/// Snapshot of the first statements of a suspension, whose plan starts with
/// the drops of `external`
fn dropped_snapshot(
    dropped: &[ConstraintStatement],
    external: &[ExternalForeignKey],
) -> ConstraintSnapshot {
    let external_dropped = external.len().min(dropped.len());
    ConstraintSnapshot::Structural {
        constraints: dropped[external_dropped..]
            .iter()
            .map(|s| (s.kind, s.name.clone()))
            .collect(),
        external_foreign_keys: external[..external_dropped].to_vec(),
    }
}

fn add_primary_key(schema: &str, entity: &Entity, pk: &PrimaryKey) -> ConstraintStatement {
    ConstraintStatement {
        kind: ConstraintKind::PrimaryKey,
        schema: schema.to_string(),
        table: entity.table.clone(),
        name: pk.name.clone(),
        sql: format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            BackendKind::Postgres.qualified_name(schema, &entity.table),
            quote_ident(&pk.name),
            column_list(&pk.columns)
        ),
    }
}

fn create_index(schema: &str, entity: &Entity, index: &Index) -> ConstraintStatement {
    ConstraintStatement {
        kind: ConstraintKind::Index,
        schema: schema.to_string(),
        table: entity.table.clone(),
        name: index.name.clone(),
        sql: format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index.name),
            BackendKind::Postgres.qualified_name(schema, &entity.table),
            column_list(&index.columns)
        ),
    }
}

fn add_foreign_key(schema: &str, entity: &Entity, fk: &ForeignKey) -> ConstraintStatement {
    ConstraintStatement {
        kind: ConstraintKind::ForeignKey,
        schema: schema.to_string(),
        table: entity.table.clone(),
        name: fk.name.clone(),
        sql: format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            BackendKind::Postgres.qualified_name(schema, &entity.table),
            quote_ident(&fk.name),
            column_list(&fk.columns),
            BackendKind::Postgres.qualified_name(schema, &fk.referenced_table),
            column_list(&fk.referenced_columns)
        ),
    }
}

pub(crate) fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Instance-scoped owner of the "constraints suspended" state of one schema
pub struct ConstraintManager {
    pool: Pool,
    catalog: Arc<Catalog>,
    schema: String,
}

impl ConstraintManager {
    pub fn new(pool: Pool, catalog: Arc<Catalog>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            catalog,
            schema: schema.into(),
        }
    }

    /// Lift constraint enforcement. Safe to call when nothing is in place.
    pub async fn suspend(&self) -> Result<ConstraintSnapshot> {
        match self.pool.kind() {
            BackendKind::Postgres => {
                let external = self.external_foreign_keys().await?;
                let plan: Vec<ConstraintStatement> = external
                    .iter()
                    .map(drop_external_foreign_key)
                    .chain(suspend_plan(&self.catalog, &self.schema))
                    .collect();
                info!(
                    statements = plan.len(),
                    external_foreign_keys = external.len(),
                    schema = %self.schema,
                    "Dropping constraints"
                );

                for (done, statement) in plan.iter().enumerate() {
                    debug!(table = %statement.table, name = %statement.name, "drop");
                    if let Err(e) = self.pool.execute_query(&statement.sql).await {
                        let err = e.context(format!(
                            "Failed to drop {:?} {} on {}",
                            statement.kind, statement.name, statement.table
                        ));
                        // Put back what this call already dropped
                        if let Err(restore_err) =
                            self.restore(&dropped_snapshot(&plan[..done], &external)).await
                        {
                            warn!(error = %format!("{:#}", restore_err), "Failed to undo a partial suspension");
                        }
                        return Err(err);
                    }
                }
                Ok(dropped_snapshot(&plan, &external))
            }
            BackendKind::Sqlite => {
                let previously_enabled = self.sqlite_foreign_keys_enabled().await?;
                info!(previously_enabled, "Disabling SQLite foreign key enforcement");
                self.pool
                    .execute_query("PRAGMA foreign_keys = OFF")
                    .await
                    .context("Failed to disable foreign keys")?;
                Ok(ConstraintSnapshot::ForeignKeySwitch { previously_enabled })
            }
        }
    }

    /// Undo a previous `suspend()`
    pub async fn restore(&self, snapshot: &ConstraintSnapshot) -> Result<()> {
        match snapshot {
            ConstraintSnapshot::Structural {
                constraints,
                external_foreign_keys,
            } => {
                let dropped: HashSet<(ConstraintKind, &str)> = constraints
                    .iter()
                    .map(|(kind, name)| (*kind, name.as_str()))
                    .collect();
                let mut plan: Vec<_> = restore_plan(&self.catalog, &self.schema)
                    .into_iter()
                    .filter(|s| dropped.contains(&(s.kind, s.name.as_str())))
                    .collect();
                // Their referenced primary keys exist again at this point
                plan.extend(external_foreign_keys.iter().map(add_external_foreign_key));
                self.apply_restore_plan(plan).await
            }
            ConstraintSnapshot::ForeignKeySwitch { previously_enabled } => {
                self.set_sqlite_foreign_keys(*previously_enabled).await
            }
        }
    }

    /// Recreate every declared constraint without a prior `suspend()`
    ///
    /// On SQLite this switches foreign key enforcement on.
    pub async fn restore_declared(&self) -> Result<()> {
        match self.pool.kind() {
            BackendKind::Postgres => {
                self.apply_restore_plan(restore_plan(&self.catalog, &self.schema))
                    .await
            }
            BackendKind::Sqlite => self.set_sqlite_foreign_keys(true).await,
        }
    }

    async fn apply_restore_plan(&self, plan: Vec<ConstraintStatement>) -> Result<()> {
        // ALTER TABLE .. ADD CONSTRAINT has no IF NOT EXISTS form
        let existing = self.existing_postgres_constraints().await?;
        info!(statements = plan.len(), schema = %self.schema, "Restoring constraints");

        let mut failures = Vec::new();
        for statement in plan {
            if statement.kind != ConstraintKind::Index
                && existing.contains(&(statement.schema.clone(), statement.name.clone()))
            {
                debug!(name = %statement.name, "constraint already present");
                continue;
            }
            debug!(table = %statement.table, name = %statement.name, "restore");
            if let Err(e) = self.pool.execute_query(&statement.sql).await {
                warn!(table = %statement.table, name = %statement.name, error = %e, "Failed to restore constraint");
                failures.push(format!("{} on {}: {:#}", statement.name, statement.table, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LoaderError::ConstraintRestore { failures }.into())
        }
    }

    /// (schema, name) of every constraint in the database
    async fn existing_postgres_constraints(&self) -> Result<HashSet<(String, String)>> {
        let PoolConnection::Postgres(mut conn) = self.pool.acquire().await? else {
            return Ok(HashSet::new());
        };
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT n.nspname::text, c.conname::text FROM pg_constraint c \
             JOIN pg_namespace n ON n.oid = c.connamespace",
        )
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list existing constraints")?;
        Ok(rows.into_iter().collect())
    }

    /// Foreign keys referencing a catalog table that the catalog does not declare
    async fn external_foreign_keys(&self) -> Result<Vec<ExternalForeignKey>> {
        let PoolConnection::Postgres(mut conn) = self.pool.acquire().await? else {
            return Ok(Vec::new());
        };
        let tables: Vec<String> = self
            .catalog
            .entities()
            .iter()
            .map(|e| e.table.clone())
            .collect();
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT cn.nspname::text, cl.relname::text, c.conname::text, pg_get_constraintdef(c.oid) \
             FROM pg_constraint c \
             JOIN pg_class cl ON cl.oid = c.conrelid \
             JOIN pg_namespace cn ON cn.oid = cl.relnamespace \
             JOIN pg_class rl ON rl.oid = c.confrelid \
             JOIN pg_namespace rn ON rn.oid = rl.relnamespace \
             WHERE c.contype = 'f' AND rn.nspname = $1 AND rl.relname = ANY($2) \
             ORDER BY cn.nspname, cl.relname, c.conname",
        )
        .bind(&self.schema)
        .bind(&tables)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list foreign keys referencing the vocabulary tables")?;

        Ok(rows
            .into_iter()
            .filter(|(schema, table, name, _)| !self.declares_foreign_key(schema, table, name))
            .map(|(schema, table, name, definition)| ExternalForeignKey {
                schema,
                table,
                name,
                definition,
            })
            .collect())
    }

    fn declares_foreign_key(&self, schema: &str, table: &str, name: &str) -> bool {
        schema == self.schema
            && self
                .catalog
                .entity(table)
                .is_some_and(|e| e.foreign_keys.iter().any(|fk| fk.name == name))
    }

    async fn sqlite_foreign_keys_enabled(&self) -> Result<bool> {
        let PoolConnection::Sqlite(mut conn) = self.pool.acquire().await? else {
            return Ok(false);
        };
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .context("Failed to read PRAGMA foreign_keys")?;
        Ok(enabled != 0)
    }

    async fn set_sqlite_foreign_keys(&self, enabled: bool) -> Result<()> {
        info!(enabled, "Restoring SQLite foreign key enforcement");
        let value = if enabled { "ON" } else { "OFF" };
        self.pool
            .execute_query(&format!("PRAGMA foreign_keys = {}", value))
            .await
            .context("Failed to restore PRAGMA foreign_keys")
    }
}
