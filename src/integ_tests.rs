//! Integration tests for the orchestrator, committer and checkpoint store
//!
//! These tests use SQLite in-memory databases and real vocabulary files to test
//! end to end scenarios of the loader.

#[cfg(test)]
mod tests {
    use crate::{
        db::{Pool, pool::PoolConnection},
        error::LoaderError,
        runner::{LoadArgs, LoadResult, init_schema_on, plan_load, reset_state_on, run_load_until},
    };
    use std::future::Future;
    use tempfile::TempDir;
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;

    const CONCEPT_HEADER: &str = "concept_id\tconcept_name\tdomain_id\tvocabulary_id\tconcept_class_id\tstandard_concept\tconcept_code\tvalid_start_date\tvalid_end_date\tinvalid_reason\n";

    // ============ Test Helpers ============

    /// Helper to create a file with custom content (lines include the header)
    async fn create_file_with_content(dir: &TempDir, filename: &str, content: &[&str]) {
        let path = dir.path().join(filename);
        let mut file = File::create(&path).await.unwrap();
        for line in content {
            file.write_all(line.as_bytes()).await.unwrap();
        }
        file.flush().await.unwrap();
    }

    fn concept_line(id: u32, valid_start_date: &str) -> String {
        format!(
            "{id}\tConcept {id}\tDrug\tRxNorm\tIngredient\tS\tC{id}\t{valid_start_date}\t20991231\t\n"
        )
    }

    /// Helper to create a CONCEPT-shaped file with `num_rows` rows
    async fn create_concept_file(dir: &TempDir, filename: &str, num_rows: u32) {
        let lines: Vec<String> = (1..=num_rows)
            .map(|id| concept_line(id, "20240101"))
            .collect();
        let mut content = vec![CONCEPT_HEADER];
        content.extend(lines.iter().map(String::as_str));
        create_file_with_content(dir, filename, &content).await;
    }

    async fn create_domain_file(dir: &TempDir) {
        create_file_with_content(
            dir,
            "DOMAIN.csv",
            &[
                "domain_id\tdomain_name\tdomain_concept_id\n",
                "Drug\tDrug\t13\n",
                "Condition\tCondition\t19\n",
            ],
        )
        .await;
    }

    /// Helper to create a SQLite pool holding the vocabulary tables
    async fn setup_sqlite_vocabulary() -> Pool {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        init_schema_on(&pool, "main").await.unwrap();
        pool
    }

    fn load_args(pool: &Pool, dir: &TempDir, flush_interval: usize) -> LoadArgs {
        let mut args = LoadArgs::new("sqlite::memory:", dir.path());
        args.schema = "main".to_string();
        args.flush_interval = flush_interval;
        args.quiet = true;
        args.test_pool = Some(pool.clone());
        args
    }

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    async fn run(args: LoadArgs) -> anyhow::Result<LoadResult> {
        run_load_until(args, never()).await
    }

    async fn query_i64(pool: &Pool, sql: &str) -> i64 {
        let PoolConnection::Sqlite(mut conn) = pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (value,): (i64,) = sqlx::query_as(sql).fetch_one(&mut *conn).await.unwrap();
        value
    }

    async fn count_rows(pool: &Pool, table: &str) -> i64 {
        query_i64(pool, &format!("SELECT COUNT(*) FROM \"{}\"", table)).await
    }

    async fn committed_rows(pool: &Pool, file_name: &str) -> i64 {
        query_i64(
            pool,
            &format!(
                "SELECT rows_committed FROM _vocabulary_loader_state WHERE filename = '{}'",
                file_name
            ),
        )
        .await
    }

    async fn foreign_keys_enabled(pool: &Pool) -> bool {
        query_i64(pool, "PRAGMA foreign_keys").await != 0
    }

    // ============ Tests ============

    #[tokio::test]
    async fn test_load_directory_with_foreign_key_cycle() {
        let dir = TempDir::new().unwrap();
        // CONCEPT.csv sorts first although its rows reference DOMAIN.csv
        create_concept_file(&dir, "CONCEPT.csv", 5).await;
        create_domain_file(&dir).await;
        let pool = setup_sqlite_vocabulary().await;

        let result = run(load_args(&pool, &dir, 2)).await.unwrap();

        assert_eq!(result.files_loaded, 2);
        assert_eq!(result.files_skipped, 0);
        assert_eq!(result.rows_committed, 7);
        assert_eq!(result.batches_committed, 4);
        assert!(result.unresolved_files.is_empty());

        let concept = &result.files[0];
        assert_eq!(concept.file_name, "CONCEPT.csv");
        assert_eq!(concept.entity, "concept");
        assert_eq!(concept.batches, 3);

        assert_eq!(count_rows(&pool, "concept").await, 5);
        assert_eq!(count_rows(&pool, "domain").await, 2);
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 5);
        assert_eq!(committed_rows(&pool, "DOMAIN.csv").await, 2);
        assert!(foreign_keys_enabled(&pool).await);
    }

    #[tokio::test]
    async fn test_second_run_commits_nothing() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 5).await;
        create_domain_file(&dir).await;
        let pool = setup_sqlite_vocabulary().await;

        run(load_args(&pool, &dir, 2)).await.unwrap();
        let second = run(load_args(&pool, &dir, 2)).await.unwrap();

        assert_eq!(second.files_loaded, 0);
        assert_eq!(second.files_skipped, 2);
        assert_eq!(second.rows_committed, 0);
        assert_eq!(second.batches_committed, 0);
        assert!(second.files.iter().all(|f| f.skipped));
        assert_eq!(count_rows(&pool, "concept").await, 5);
    }

    #[tokio::test]
    async fn test_resume_after_failed_batch() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<String> = vec![
            concept_line(1, "20240101"),
            concept_line(2, "20240101"),
            concept_line(3, "20240101"),
            concept_line(4, "2024-01-01"),
            concept_line(5, "20240101"),
        ];
        let mut content = vec![CONCEPT_HEADER];
        content.extend(rows.iter().map(String::as_str));
        create_file_with_content(&dir, "CONCEPT.csv", &content).await;
        let pool = setup_sqlite_vocabulary().await;

        let err = run(load_args(&pool, &dir, 2)).await.unwrap_err();
        match err.downcast_ref::<LoaderError>() {
            Some(LoaderError::Cast {
                file,
                line,
                column,
                value,
                ..
            }) => {
                assert_eq!(file, "CONCEPT.csv");
                assert_eq!(*line, 5);
                assert_eq!(column, "valid_start_date");
                assert_eq!(value, "2024-01-01");
            }
            other => panic!("expected a cast error, got {other:?}"),
        }

        // The first batch is durable, the batch holding the bad row is not
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 2);
        assert_eq!(count_rows(&pool, "concept").await, 2);
        assert!(foreign_keys_enabled(&pool).await);

        // Same row count, so the fixed file resumes from the checkpoint
        let fixed: Vec<String> = (1..=5).map(|id| concept_line(id, "20240101")).collect();
        let mut content = vec![CONCEPT_HEADER];
        content.extend(fixed.iter().map(String::as_str));
        create_file_with_content(&dir, "CONCEPT.csv", &content).await;

        let result = run(load_args(&pool, &dir, 2)).await.unwrap();
        let report = &result.files[0];
        assert_eq!(report.resumed_from, 2);
        assert_eq!(report.rows_committed, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(count_rows(&pool, "concept").await, 5);
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 5);
    }

    #[tokio::test]
    async fn test_changed_row_count_starts_a_new_checkpoint() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 2).await;
        let pool = setup_sqlite_vocabulary().await;

        run(load_args(&pool, &dir, 10)).await.unwrap();

        // A new export with more rows; truncation drops the stale checkpoint
        create_concept_file(&dir, "CONCEPT.csv", 4).await;
        let mut args = load_args(&pool, &dir, 10);
        args.truncate_tables = true;
        let result = run(args).await.unwrap();

        assert_eq!(result.files[0].resumed_from, 0);
        assert_eq!(result.rows_committed, 4);
        assert_eq!(count_rows(&pool, "concept").await, 4);
        assert_eq!(
            query_i64(&pool, "SELECT COUNT(*) FROM _vocabulary_loader_state").await,
            1
        );
    }

    #[tokio::test]
    async fn test_unsupported_backend_fails_before_reading_files() {
        let mut args = LoadArgs::new("mysql://localhost/omop", "/does/not/exist");
        args.quiet = true;

        let err = run(args).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoaderError>(),
            Some(LoaderError::UnsupportedBackend { kind }) if kind == "mysql"
        ));
    }

    #[tokio::test]
    async fn test_unresolved_file_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        create_domain_file(&dir).await;
        create_file_with_content(&dir, "EXTRA_DATA.csv", &["a\tb\n", "1\t2\n"]).await;
        create_file_with_content(&dir, "README.txt", &["not a vocabulary file\n"]).await;
        let pool = setup_sqlite_vocabulary().await;

        let result = run(load_args(&pool, &dir, 10)).await.unwrap();

        assert_eq!(result.unresolved_files, vec!["EXTRA_DATA.csv"]);
        assert_eq!(result.files_loaded, 1);
        assert_eq!(count_rows(&pool, "domain").await, 2);
    }

    #[tokio::test]
    async fn test_file_overrides() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT_CPT4.csv", 3).await;
        create_file_with_content(
            &dir,
            "LOCAL_SYNONYMS.csv",
            &[
                "concept_id\tconcept_synonym_name\tlanguage_concept_id\n",
                "1\tASA\t4180186\n",
            ],
        )
        .await;
        let pool = setup_sqlite_vocabulary().await;

        let mut args = load_args(&pool, &dir, 10);
        args.file_overrides
            .insert("local_synonyms".to_string(), "concept_synonym".to_string());
        let result = run(args).await.unwrap();

        assert!(result.unresolved_files.is_empty());
        assert_eq!(result.files[0].entity, "concept");
        assert_eq!(result.files[1].entity, "concept_synonym");
        assert_eq!(count_rows(&pool, "concept").await, 3);
        assert_eq!(count_rows(&pool, "concept_synonym").await, 1);
    }

    #[tokio::test]
    async fn test_truncate_once_per_table_and_reset_checkpoints() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 3).await;
        let pool = setup_sqlite_vocabulary().await;

        run(load_args(&pool, &dir, 10)).await.unwrap();

        // Two files feed `concept`; the second must not wipe the first
        create_file_with_content(
            &dir,
            "CONCEPT_CPT4.csv",
            &[CONCEPT_HEADER, &concept_line(100, "20240101")],
        )
        .await;
        let mut args = load_args(&pool, &dir, 10);
        args.truncate_tables = true;
        let result = run(args).await.unwrap();

        assert_eq!(result.files_loaded, 2);
        assert_eq!(result.files_skipped, 0);
        assert_eq!(result.rows_committed, 4);
        assert_eq!(count_rows(&pool, "concept").await, 4);
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 3);
    }

    #[tokio::test]
    async fn test_interruption_restores_constraints() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 50).await;
        let pool = setup_sqlite_vocabulary().await;

        let err = run_load_until(load_args(&pool, &dir, 5), std::future::ready(()))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LoaderError>(),
            Some(LoaderError::Interrupted)
        ));
        // The signal arrived while suspending: nothing is loaded, enforcement is back
        assert_eq!(count_rows(&pool, "concept").await, 0);
        assert!(foreign_keys_enabled(&pool).await);
    }

    #[tokio::test]
    async fn test_without_suspension_foreign_keys_reject_unordered_load() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 2).await;
        let pool = setup_sqlite_vocabulary().await;

        let mut args = load_args(&pool, &dir, 10);
        args.suspend_constraints = false;
        let err = run(args).await.unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to commit rows 1..2 of CONCEPT.csv"));
        assert_eq!(count_rows(&pool, "concept").await, 0);
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 0);
    }

    #[tokio::test]
    async fn test_constraints_left_suspended_when_restore_disabled() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 2).await;
        let pool = setup_sqlite_vocabulary().await;

        let mut args = load_args(&pool, &dir, 10);
        args.restore_constraints = false;
        run(args).await.unwrap();

        assert!(!foreign_keys_enabled(&pool).await);
    }

    #[tokio::test]
    async fn test_max_rows_per_file() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 5).await;
        let pool = setup_sqlite_vocabulary().await;

        let mut args = load_args(&pool, &dir, 2);
        args.max_rows_per_file = Some(3);
        let result = run(args).await.unwrap();

        assert_eq!(result.rows_committed, 3);
        assert_eq!(result.batches_committed, 2);
        assert_eq!(count_rows(&pool, "concept").await, 3);
        assert_eq!(committed_rows(&pool, "CONCEPT.csv").await, 3);
    }

    #[tokio::test]
    async fn test_dates_are_rewritten() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 1).await;
        let pool = setup_sqlite_vocabulary().await;

        run(load_args(&pool, &dir, 10)).await.unwrap();

        let PoolConnection::Sqlite(mut conn) = pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (start, end, invalid_reason): (String, String, Option<String>) = sqlx::query_as(
            "SELECT valid_start_date, valid_end_date, invalid_reason FROM concept WHERE concept_id = 1",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(start, "2024-01-01");
        assert_eq!(end, "2099-12-31");
        assert_eq!(invalid_reason, None);
    }

    #[tokio::test]
    async fn test_checkpointing_disabled_keeps_no_state() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 3).await;
        let pool = setup_sqlite_vocabulary().await;

        let mut args = load_args(&pool, &dir, 2);
        args.checkpointing = false;
        let result = run(args).await.unwrap();

        assert_eq!(result.rows_committed, 3);
        assert_eq!(
            query_i64(
                &pool,
                "SELECT COUNT(*) FROM sqlite_master WHERE name = '_vocabulary_loader_state'"
            )
            .await,
            0
        );
    }

    #[tokio::test]
    async fn test_reset_state_forgets_progress() {
        let dir = TempDir::new().unwrap();
        create_domain_file(&dir).await;
        let pool = setup_sqlite_vocabulary().await;

        run(load_args(&pool, &dir, 10)).await.unwrap();
        reset_state_on(&pool, "main").await.unwrap();
        reset_state_on(&pool, "main").await.unwrap();

        let mut args = load_args(&pool, &dir, 10);
        args.truncate_tables = true;
        let result = run(args).await.unwrap();
        assert_eq!(result.files_loaded, 1);
        assert_eq!(result.rows_committed, 2);
        assert_eq!(count_rows(&pool, "domain").await, 2);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let pool = setup_sqlite_vocabulary().await;
        let mut args = LoadArgs::new("sqlite::memory:", "/does/not/exist");
        args.quiet = true;
        args.test_pool = Some(pool.clone());

        let err = run(args).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoaderError>(),
            Some(LoaderError::MissingDirectory { .. })
        ));
        // Nothing was suspended
        assert!(foreign_keys_enabled(&pool).await);
    }

    #[tokio::test]
    async fn test_plan_load() {
        let dir = TempDir::new().unwrap();
        create_concept_file(&dir, "CONCEPT.csv", 4).await;
        create_domain_file(&dir).await;
        create_file_with_content(&dir, "EXTRA_DATA.csv", &["a\n"]).await;

        let args = LoadArgs::new("postgres://localhost/omop", dir.path());
        let plan = plan_load(&args).await.unwrap();

        assert_eq!(plan.backend, "postgres");
        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files[0].table, "concept");
        assert_eq!(plan.files[0].total_rows, 4);
        assert_eq!(plan.files[1].table, "domain");
        assert_eq!(plan.unresolved_files, vec!["EXTRA_DATA.csv"]);
    }
}
