//! Download directory housekeeping

use super::naming::PART_SUFFIX;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs;

/// File count and size for one extension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionStats {
    /// Number of files
    pub count: u64,
    /// Total size in bytes
    pub bytes: u64,
}

/// What the download directory currently holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Completed files
    pub files: u64,
    /// Size of completed files in bytes
    pub bytes: u64,
    /// `.part` files still present
    pub partial_files: u64,
    /// Completed files per lowercase extension (`""` for none)
    pub by_extension: BTreeMap<String, ExtensionStats>,
}

impl StorageStats {
    /// Size of completed files in MiB, rounded to two decimals
    pub fn megabytes(&self) -> f64 {
        (self.bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
    }
}

/// Remove `.part` files in `dir` that have not been written for `older_than`
///
/// A missing directory counts as empty. Files that cannot be removed are
/// logged and skipped.
pub async fn sweep_stale_parts(dir: &Path, older_than: Duration) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_part = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PART_SUFFIX));
        if !is_part {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale partial file");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale partial file");
            }
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "Swept stale partial files");
    }
    Ok(removed)
}

/// Count files and bytes in `dir`, by extension
///
/// A missing directory yields empty stats.
pub async fn storage_stats(dir: &Path) -> Result<StorageStats> {
    let mut stats = StorageStats::default();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.ends_with(PART_SUFFIX) {
            stats.partial_files += 1;
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let size = metadata.len();
        stats.files += 1;
        stats.bytes += size;
        let per_ext = stats.by_extension.entry(ext).or_default();
        per_ext.count += 1;
        per_ext.bytes += size;
    }

    Ok(stats)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn only_old_partial_files_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let old_part = dir.path().join("city_a.pdf.part");
        let fresh_part = dir.path().join("city_b.pdf.part");
        let old_done = dir.path().join("city_c.pdf");
        for path in [&old_part, &fresh_part, &old_done] {
            fs::write(path, b"%PDF").await.unwrap();
        }
        backdate(&old_part, Duration::from_secs(2 * 3600));
        backdate(&old_done, Duration::from_secs(2 * 3600));

        let removed = sweep_stale_parts(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!old_part.exists());
        assert!(fresh_part.exists());
        assert!(old_done.exists(), "completed files are never swept");
    }

    #[tokio::test]
    async fn zero_age_sweeps_every_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pdf.part"), b"x").await.unwrap();
        fs::write(dir.path().join("b.pdf.part"), b"x").await.unwrap();

        assert_eq!(sweep_stale_parts(dir.path(), Duration::ZERO).await.unwrap(), 2);
        assert_eq!(storage_stats(dir.path()).await.unwrap(), StorageStats::default());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("never-created");

        assert_eq!(sweep_stale_parts(&absent, Duration::ZERO).await.unwrap(), 0);
        assert_eq!(storage_stats(&absent).await.unwrap(), StorageStats::default());
    }

    #[tokio::test]
    async fn stats_group_completed_files_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pdf"), vec![0u8; 100]).await.unwrap();
        fs::write(dir.path().join("b.PDF"), vec![0u8; 50]).await.unwrap();
        fs::write(dir.path().join("c.csv"), vec![0u8; 10]).await.unwrap();
        fs::write(dir.path().join("d.pdf.part"), vec![0u8; 999]).await.unwrap();
        fs::create_dir(dir.path().join("nested")).await.unwrap();

        let stats = storage_stats(dir.path()).await.unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.bytes, 160);
        assert_eq!(stats.partial_files, 1);
        assert_eq!(
            stats.by_extension[".pdf"],
            ExtensionStats {
                count: 2,
                bytes: 150
            }
        );
        assert_eq!(stats.by_extension[".csv"].count, 1);
        assert!(stats.megabytes() < 0.01);
    }
}
