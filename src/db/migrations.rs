//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: ledger tables
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Wrap migration in a transaction so partial failures don't leave the DB in a broken state
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            Self::create_sessions_schema(conn).await?;
            Self::create_records_schema(conn).await?;
            Self::create_visited_schema(conn).await?;
            Self::create_error_logs_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v1: {}",
                            e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v1 complete");
        Ok(())
    }

    /// Run one DDL statement, labelling failures with `what`
    async fn execute_ddl(conn: &mut SqliteConnection, sql: &str, what: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create {}: {}",
                what, e
            )))
        })?;
        Ok(())
    }

    /// Create scrape_sessions table
    async fn create_sessions_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE scrape_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                links_found INTEGER NOT NULL DEFAULT 0,
                links_filtered_in INTEGER NOT NULL DEFAULT 0,
                downloads_succeeded INTEGER NOT NULL DEFAULT 0,
                downloads_failed INTEGER NOT NULL DEFAULT 0,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                success INTEGER,
                error_message TEXT
            )
            "#,
            "scrape_sessions table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_sessions_site ON scrape_sessions(site_name, started_at DESC)",
            "index",
        )
        .await
    }

    /// Create download_records table and the one-success-per-url guard
    async fn create_records_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE download_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL,
                url TEXT NOT NULL,
                local_path TEXT,
                file_size_bytes INTEGER,
                checksum TEXT,
                status TEXT NOT NULL CHECK (status IN ('SUCCESS', 'FAILED')),
                error_kind TEXT,
                error_message TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
            "download_records table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE UNIQUE INDEX idx_records_success_url ON download_records(url) WHERE status = 'SUCCESS'",
            "success uniqueness index",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_records_url ON download_records(url)",
            "index",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_records_site ON download_records(site_name, created_at DESC)",
            "index",
        )
        .await
    }

    /// Create visited_urls table
    async fn create_visited_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE visited_urls (
                site_name TEXT NOT NULL,
                url TEXT NOT NULL,
                outcome TEXT NOT NULL,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (site_name, url)
            )
            "#,
            "visited_urls table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_visited_url ON visited_urls(url, last_seen_at DESC)",
            "index",
        )
        .await
    }

    /// Create error_logs table
    async fn create_error_logs_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE error_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL,
                url TEXT,
                stage TEXT NOT NULL,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )
            "#,
            "error_logs table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_error_logs_time ON error_logs(occurred_at)",
            "index",
        )
        .await
    }

    /// Record that a migration was applied
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Check that the ledger still answers queries
    ///
    /// Used to tell a failed statement apart from a ledger that is gone.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
