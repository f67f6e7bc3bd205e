use super::temp_db;
use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let (db, _file) = temp_db().await;

    let mut conn = db.pool.acquire().await.unwrap();
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    for expected in [
        "download_records",
        "visited_urls",
        "scrape_sessions",
        "error_logs",
        "schema_version",
    ] {
        assert!(
            tables.contains(&expected.to_string()),
            "missing table {expected}, got {tables:?}"
        );
    }

    drop(conn);
    db.close().await;
}

#[tokio::test]
async fn test_migrations_are_idempotent_across_reopen() {
    let temp_file = NamedTempFile::new().unwrap();

    let db = Database::new(temp_file.path()).await.unwrap();
    db.close().await;

    // Reopening must not re-run v1 (which would fail on CREATE TABLE)
    let db = Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1]);
    db.close().await;
}

#[tokio::test]
async fn test_creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("ledger.db");

    let db = Database::new(&path).await.unwrap();
    assert!(path.exists(), "database file should be created");
    db.close().await;
}

#[tokio::test]
async fn test_ping() {
    let (db, _file) = temp_db().await;
    db.ping().await.unwrap();

    db.pool().close().await;
    let err = db.ping().await.unwrap_err();
    assert!(err.is_ledger_unavailable(), "closed pool must report unavailable, got {err:?}");
}
