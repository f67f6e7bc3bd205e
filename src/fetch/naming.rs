//! Local filenames for fetched files

use crate::config::normalize_file_type;
use crate::types::CandidateLink;
use crate::utils::{
    MAX_FILENAME_LEN, sanitize_filename, split_extension, truncate_on_char_boundary, url_file_name,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Suffix used while a file is still being written
pub const PART_SUFFIX: &str = ".part";

/// Longest extension (dot included) kept as an extension
const MAX_EXTENSION_LEN: usize = 10;

/// Base filename (before disambiguation) for a candidate
///
/// `<site>_<name><ext>`, where `name` is the title, else the
/// Content-Disposition filename, else the last url path segment. The
/// candidate's file type supplies the extension unless the name already
/// ends in it. Without a file type, a server- or url-provided name keeps a
/// short alphanumeric extension of its own.
pub fn base_file_name(candidate: &CandidateLink, disposition: Option<&str>) -> String {
    let title = candidate
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let from_title = title.is_some();

    let source = title
        .map(str::to_string)
        .or_else(|| disposition.map(str::to_string))
        .or_else(|| url_file_name(&candidate.url))
        .unwrap_or_default();
    let source = sanitize_filename(&source);

    let expected = normalize_file_type(&candidate.file_type);
    let (stem, ext) = match split_extension(&source) {
        (stem, Some(ext)) if ext == expected => (stem, ext),
        _ if expected.len() > 1 => (source.clone(), expected),
        (stem, Some(ext)) if !from_title && is_plain_extension(&ext) => (stem, ext),
        _ => (source.clone(), String::new()),
    };

    format!(
        "{}_{}{}",
        sanitize_filename(&candidate.site_name),
        sanitize_filename(&stem),
        sanitize_extension(&ext)
    )
}

fn is_plain_extension(ext: &str) -> bool {
    ext.len() <= MAX_EXTENSION_LEN && ext[1..].chars().all(|c| c.is_ascii_alphanumeric())
}

fn sanitize_extension(ext: &str) -> String {
    ext.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect()
}

/// Hands out unique paths inside the download directory
///
/// A name stays reserved until released, so concurrent workers never write
/// to the same path. Names already present on disk are skipped too.
#[derive(Debug)]
pub struct NameAllocator {
    dir: PathBuf,
    reserved: Mutex<HashSet<PathBuf>>,
}

impl NameAllocator {
    /// Create an allocator for `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Download directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a free path for `base`, appending `_1`, `_2`, ... on collision
    ///
    /// The whole name, suffix included, fits in [`MAX_FILENAME_LEN`].
    pub async fn reserve(&self, base: &str) -> PathBuf {
        let (stem, ext) = match split_extension(base) {
            (stem, Some(ext)) if ext.len() <= MAX_EXTENSION_LEN => (stem, ext),
            _ => (base.to_string(), String::new()),
        };

        let mut reserved = self.reserved.lock().await;
        let mut counter = 0u32;
        loop {
            let suffix = if counter == 0 {
                String::new()
            } else {
                format!("_{counter}")
            };
            let budget = MAX_FILENAME_LEN.saturating_sub(suffix.len() + ext.len());
            let name = format!("{}{}{}", truncate_on_char_boundary(&stem, budget), suffix, ext);
            let path = self.dir.join(&name);

            if !reserved.contains(&path) && !Self::exists_on_disk(&path).await {
                reserved.insert(path.clone());
                return path;
            }
            counter += 1;
        }
    }

    /// Give a reserved path back
    pub async fn release(&self, path: &Path) {
        self.reserved.lock().await.remove(path);
    }

    #[cfg(test)]
    pub(crate) async fn reserved_len(&self) -> usize {
        self.reserved.lock().await.len()
    }

    async fn exists_on_disk(path: &Path) -> bool {
        let part = part_path(path);
        tokio::fs::try_exists(path).await.unwrap_or(false)
            || tokio::fs::try_exists(&part).await.unwrap_or(false)
    }
}

/// Temporary path a file is streamed to before the final rename
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}
