//! Utility functions for url validation and filename handling

use std::path::Path;

/// Maximum length of a generated filename, extension included
pub const MAX_FILENAME_LEN: usize = 200;

/// Url schemes that are never fetched even if they parse
const REJECTED_SCHEMES: &[&str] = &["javascript", "data", "mailto", "ftp", "file", "tel"];

/// Returns true if `url` is an absolute http(s) url with a host
///
/// # Examples
///
/// ```
/// use harvest_dl::utils::is_fetchable_url;
///
/// assert!(is_fetchable_url("https://example.com/report.pdf"));
/// assert!(!is_fetchable_url("/relative/report.pdf"));
/// assert!(!is_fetchable_url("javascript:void(0)"));
/// ```
#[must_use]
pub fn is_fetchable_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url.trim()) else {
        return false;
    };
    if REJECTED_SCHEMES.contains(&parsed.scheme()) {
        return false;
    }
    matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some_and(|h| !h.is_empty())
}

/// Make a string safe to use as a filename component
///
/// Replaces `<>:"/\|?*` and control characters with `_`, trims surrounding
/// spaces and dots, and falls back to `unnamed_file` when nothing is left.
///
/// # Examples
///
/// ```
/// use harvest_dl::utils::sanitize_filename;
///
/// assert_eq!(sanitize_filename("Q3: Results/Summary?"), "Q3_ Results_Summary_");
/// assert_eq!(sanitize_filename("  ..  "), "unnamed_file");
/// ```
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed_file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Truncate a string to at most `max` bytes on a char boundary
#[must_use]
pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Last non-empty path segment of a url, percent-decoded
#[must_use]
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?
        .to_string();
    Some(
        urlencoding::decode(&last)
            .map(|d| d.into_owned())
            .unwrap_or(last),
    )
}

/// Split a filename into stem and lowercase extension (with leading dot)
#[must_use]
pub fn split_extension(name: &str) -> (String, Option<String>) {
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
    ) {
        (Some(stem), Some(ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), Some(format!(".{}", ext.to_lowercase())))
        }
        _ => (name.to_string(), None),
    }
}

/// Extract a filename from the Content-Disposition header, if present
///
/// Supports both `filename="x.pdf"` and RFC 5987 `filename*=UTF-8''x%20y.pdf`.
/// The extension is kept.
pub fn filename_from_content_disposition(response: &reqwest::Response) -> Option<String> {
    let value = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;

    let mut plain = None;
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'encoded-filename
            let encoded = encoded.rsplit('\'').next().unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(encoded)
                && !decoded.trim().is_empty()
            {
                return Some(decoded.into_owned());
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.trim().is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::MockServer;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[test]
    fn fetchable_url_accepts_http_and_https_only() {
        assert!(is_fetchable_url("http://example.com/a.pdf"));
        assert!(is_fetchable_url("https://example.com/a.pdf?x=1"));
        for bad in [
            "ftp://example.com/a.pdf",
            "mailto:someone@example.com",
            "data:text/plain;base64,SGVsbG8=",
            "file:///etc/passwd",
            "tel:+123",
            "javascript:alert(1)",
            "example.com/a.pdf",
            "",
        ] {
            assert!(!is_fetchable_url(bad), "{bad} must be rejected");
        }
    }

    #[test]
    fn sanitize_replaces_reserved_and_control_characters() {
        assert_eq!(sanitize_filename("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename(" .hidden. "), "hidden");
        assert_eq!(sanitize_filename(""), "unnamed_file");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ééééé"; // 2 bytes each
        assert_eq!(truncate_on_char_boundary(s, 3), "é");
        assert_eq!(truncate_on_char_boundary(s, 100), s);
    }

    #[test]
    fn url_file_name_decodes_last_segment() {
        assert_eq!(
            url_file_name("https://x.example/docs/Annual%20Report.pdf").as_deref(),
            Some("Annual Report.pdf")
        );
        assert_eq!(
            url_file_name("https://x.example/docs/").as_deref(),
            Some("docs")
        );
        assert_eq!(url_file_name("https://x.example/"), None);
    }

    #[test]
    fn split_extension_lowercases_extension() {
        assert_eq!(
            split_extension("Report.PDF"),
            ("Report".to_string(), Some(".pdf".to_string()))
        );
        assert_eq!(split_extension("README"), ("README".to_string(), None));
    }

    /// Helper: start a mock server, register a response, make a GET request, return the response.
    async fn mock_response(template: ResponseTemplate) -> reqwest::Response {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download"))
            .respond_with(template)
            .mount(&server)
            .await;
        reqwest::get(format!("{}/download", server.uri()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn content_disposition_quoted_filename() {
        let resp = mock_response(ResponseTemplate::new(200).insert_header(
            "Content-Disposition",
            r#"attachment; filename="budget-2025.pdf""#,
        ))
        .await;
        assert_eq!(
            filename_from_content_disposition(&resp).as_deref(),
            Some("budget-2025.pdf")
        );
    }

    #[tokio::test]
    async fn content_disposition_rfc5987_filename_wins() {
        let resp = mock_response(ResponseTemplate::new(200).insert_header(
            "Content-Disposition",
            "attachment; filename=\"fallback.pdf\"; filename*=UTF-8''annual%20plan.pdf",
        ))
        .await;
        assert_eq!(
            filename_from_content_disposition(&resp).as_deref(),
            Some("annual plan.pdf")
        );
    }

    #[tokio::test]
    async fn missing_content_disposition_yields_none() {
        let resp = mock_response(ResponseTemplate::new(200)).await;
        assert!(filename_from_content_disposition(&resp).is_none());
    }
}
