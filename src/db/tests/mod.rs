mod migrations;
mod sessions;

use crate::db::Database;
use tempfile::NamedTempFile;

/// Open a fresh ledger backed by a temp file; keep the file alive for the test's duration
pub(super) async fn temp_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}
