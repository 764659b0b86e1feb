use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use super::constraints::{ConstraintManager, column_list};
use super::pool::{BackendKind, Pool, quote_ident};
use crate::catalog::{Catalog, Entity};

/// Generate the `CREATE TABLE IF NOT EXISTS` statement for an entity
///
/// Postgres tables are created bare; their keys and indexes are added by the
/// constraint manager afterwards. SQLite cannot add constraints to an existing
/// table, so they are declared inline.
pub fn create_table_sql(kind: BackendKind, schema: &str, entity: &Entity) -> String {
    let mut definitions: Vec<String> = entity
        .columns
        .iter()
        .map(|col| {
            let sql_type = match kind {
                BackendKind::Postgres => col.sql_type.to_postgres(),
                BackendKind::Sqlite => col.sql_type.to_sqlite().to_string(),
            };
            let nullable_clause = if col.nullable { "" } else { " NOT NULL" };
            format!("  {} {}{}", quote_ident(&col.name), sql_type, nullable_clause)
        })
        .collect();

    if kind == BackendKind::Sqlite {
        if let Some(pk) = &entity.primary_key {
            definitions.push(format!(
                "  CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(&pk.name),
                column_list(&pk.columns)
            ));
        }
        for fk in &entity.foreign_keys {
            definitions.push(format!(
                "  CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&fk.name),
                column_list(&fk.columns),
                quote_ident(&fk.referenced_table),
                column_list(&fk.referenced_columns)
            ));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        kind.qualified_name(schema, &entity.table),
        definitions.join(",\n")
    )
}

/// SQLite index statements for an entity (Postgres indexes come from the constraint manager)
pub fn sqlite_index_sql(entity: &Entity) -> Vec<String> {
    entity
        .indexes
        .iter()
        .map(|index| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&index.name),
                quote_ident(&entity.table),
                column_list(&index.columns)
            )
        })
        .collect()
}

/// Create every catalog table that does not exist yet, with its constraints
pub async fn init_schema(pool: &Pool, catalog: Arc<Catalog>, schema: &str) -> Result<()> {
    let kind = pool.kind();
    info!(%kind, schema, tables = catalog.entities().len(), "Initialising schema");

    if kind == BackendKind::Postgres {
        pool.execute_query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .await
            .with_context(|| format!("Failed to create schema {}", schema))?;
    }

    for entity in catalog.entities() {
        pool.execute_query(&create_table_sql(kind, schema, entity))
            .await
            .with_context(|| format!("Failed to create table {}", entity.table))?;
    }

    match kind {
        BackendKind::Postgres => {
            ConstraintManager::new(pool.clone(), catalog, schema)
                .restore_declared()
                .await
        }
        BackendKind::Sqlite => {
            for entity in catalog.entities() {
                for sql in sqlite_index_sql(entity) {
                    pool.execute_query(&sql)
                        .await
                        .with_context(|| format!("Failed to index table {}", entity.table))?;
                }
            }
            Ok(())
        }
    }
}

/// Remove every row of `table` ahead of a fresh load
pub async fn truncate_table(pool: &Pool, schema: &str, table: &str) -> Result<()> {
    let qualified = pool.qualified_table_name(schema, table);
    let sql = match pool.kind() {
        BackendKind::Postgres => format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", qualified),
        BackendKind::Sqlite => format!("DELETE FROM {}", qualified),
    };
    info!(table, "Truncating table");
    pool.execute_query(&sql)
        .await
        .with_context(|| format!("Failed to truncate {}", table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqlType;
    use crate::db::PoolConnection;

    fn synonym_entity() -> Entity {
        Entity::new("concept_synonym")
            .column("concept_id", SqlType::Integer)
            .column("concept_synonym_name", SqlType::Varchar(1000))
            .nullable_column("language_concept_id", SqlType::Integer)
            .foreign_key("fpk_synonym_concept", &["concept_id"], "concept", &["concept_id"])
            .index("idx_synonym", &["concept_id"])
    }

    #[test]
    fn test_generate_postgres_ddl() {
        let ddl = create_table_sql(BackendKind::Postgres, "vocab", &synonym_entity());

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"vocab\".\"concept_synonym\""));
        assert!(ddl.contains("\"concept_id\" INTEGER NOT NULL"));
        assert!(ddl.contains("\"concept_synonym_name\" VARCHAR(1000) NOT NULL"));
        assert!(ddl.contains("\"language_concept_id\" INTEGER\n"));
        assert!(!ddl.contains("FOREIGN KEY"));
    }

    #[test]
    fn test_generate_sqlite_ddl_with_inline_constraints() {
        let ddl = create_table_sql(BackendKind::Sqlite, "ignored", &synonym_entity());

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"concept_synonym\""));
        assert!(ddl.contains("\"concept_synonym_name\" TEXT NOT NULL"));
        assert!(ddl.contains(
            "CONSTRAINT \"fpk_synonym_concept\" FOREIGN KEY (\"concept_id\") REFERENCES \"concept\" (\"concept_id\")"
        ));
        assert_eq!(
            sqlite_index_sql(&synonym_entity()),
            vec!["CREATE INDEX IF NOT EXISTS \"idx_synonym\" ON \"concept_synonym\" (\"concept_id\")"]
        );
    }

    #[tokio::test]
    async fn test_init_schema_sqlite_is_idempotent() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let catalog = Arc::new(Catalog::vocabulary());

        init_schema(&pool, catalog.clone(), "main").await.unwrap();
        init_schema(&pool, catalog.clone(), "main").await.unwrap();

        let PoolConnection::Sqlite(mut conn) = pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(tables as usize, catalog.entities().len());

        let (indexes,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE name = 'idx_concept_code'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(indexes, 1);
    }

    #[tokio::test]
    async fn test_truncate_table_sqlite() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        pool.execute_query("CREATE TABLE \"domain\" (domain_id TEXT)")
            .await
            .unwrap();
        pool.execute_query("INSERT INTO \"domain\" VALUES ('Drug'), ('Condition')")
            .await
            .unwrap();

        truncate_table(&pool, "main", "domain").await.unwrap();

        let PoolConnection::Sqlite(mut conn) = pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM \"domain\"")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
