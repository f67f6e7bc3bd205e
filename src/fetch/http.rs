//! A single HTTP fetch attempt

use super::naming::{NameAllocator, base_file_name, part_path};
use crate::config::{FetchConfig, normalize_file_type};
use crate::error::FetchError;
use crate::types::CandidateLink;
use crate::utils::filename_from_content_disposition;
use crate::{Error, Result};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const PDF_MAGIC: &[u8] = b"%PDF";

/// A file written to its final location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Final path
    pub path: PathBuf,
    /// Bytes written
    pub size: u64,
    /// Hex SHA-256 of the contents
    pub checksum: String,
}

/// Issues requests and streams bodies to disk
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_file_size: u64,
    verify_content: bool,
}

impl HttpFetcher {
    /// Build the HTTP client from fetch settings
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_file_size: config.max_file_size_bytes,
            verify_content: config.verify_content,
        })
    }

    /// One attempt: request, stream to `<name>.part`, verify, rename
    ///
    /// The reserved name is released in every case. On failure nothing is
    /// left on disk.
    pub async fn fetch(
        &self,
        candidate: &CandidateLink,
        names: &NameAllocator,
    ) -> std::result::Result<FetchedFile, FetchError> {
        let response = self
            .client
            .get(&candidate.url)
            .send()
            .await
            .map_err(FetchError::from)?;

        check_status(response.status(), response.headers())?;

        if let Some(declared) = response.content_length()
            && declared > self.max_file_size
        {
            return Err(FetchError::TooLarge {
                limit: self.max_file_size,
                size: declared,
            });
        }

        let expected_type = normalize_file_type(&candidate.file_type);
        if self.verify_content {
            check_content_type(response.headers(), &expected_type)?;
        }

        let disposition = filename_from_content_disposition(&response);
        let path = names
            .reserve(&base_file_name(candidate, disposition.as_deref()))
            .await;
        let part = part_path(&path);

        match self.stream_to_disk(response, &part, &expected_type).await {
            Ok((size, checksum)) => match tokio::fs::rename(&part, &path).await {
                Ok(()) => {
                    // The file on disk now holds the name
                    names.release(&path).await;
                    Ok(FetchedFile {
                        path,
                        size,
                        checksum,
                    })
                }
                Err(e) => {
                    discard(&part, &path, names).await;
                    Err(FetchError::Storage(format!(
                        "failed to move {} into place: {e}",
                        part.display()
                    )))
                }
            },
            Err(e) => {
                discard(&part, &path, names).await;
                Err(e)
            }
        }
    }

    async fn stream_to_disk(
        &self,
        response: reqwest::Response,
        part: &Path,
        expected_type: &str,
    ) -> std::result::Result<(u64, String), FetchError> {
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| FetchError::Storage(format!("failed to create {}: {e}", part.display())))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut head = Vec::with_capacity(PDF_MAGIC.len());
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::from)?;
            written += chunk.len() as u64;
            if written > self.max_file_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_file_size,
                    size: written,
                });
            }

            if head.len() < PDF_MAGIC.len() {
                let take = (PDF_MAGIC.len() - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }

            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Storage(format!("failed to write {}: {e}", part.display())))?;
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Storage(format!("failed to flush {}: {e}", part.display())))?;

        if self.verify_content && expected_type == ".pdf" && !head.starts_with(PDF_MAGIC) {
            return Err(FetchError::DisallowedContent(
                "response body is not a PDF".to_string(),
            ));
        }

        Ok((written, format!("{:x}", hasher.finalize())))
    }
}

/// Remove a partial file and free its name
async fn discard(part: &Path, path: &Path, names: &NameAllocator) {
    if let Err(e) = tokio::fs::remove_file(part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %part.display(), error = %e, "Failed to remove partial file");
    }
    names.release(path).await;
}

/// Map a non-success status to its fetch error
fn check_status(status: StatusCode, headers: &HeaderMap) -> std::result::Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited {
            retry_after: parse_retry_after(headers),
        });
    }
    if status.is_server_error() {
        return Err(FetchError::ServerError {
            status: status.as_u16(),
        });
    }
    Err(FetchError::ClientError {
        status: status.as_u16(),
    })
}

/// HTML served for a non-HTML type is an error page, not the file
fn check_content_type(headers: &HeaderMap, expected_type: &str) -> std::result::Result<(), FetchError> {
    if matches!(expected_type, ".html" | ".htm") {
        return Ok(());
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("text/html") {
        return Err(FetchError::DisallowedContent(format!(
            "expected {expected_type}, server sent {content_type}"
        )));
    }
    Ok(())
}

/// Parse `Retry-After` as delay-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or_default())
}
