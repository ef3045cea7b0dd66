//! Output filename derivation.
//!
//! Preference order: explicit `filename_template` from the options, then a
//! server-suggested name (Content-Disposition), then the URL path basename,
//! and finally a timestamped fallback for URLs with no usable basename.

use chrono::Utc;
use url::Url;

use crate::options::DownloadOptions;

/// Maximum filename length kept after sanitization.
const MAX_FILENAME_LEN: usize = 200;

pub fn generate_filename(
    url: &Url,
    options: &DownloadOptions,
    suggested: Option<&str>,
) -> String {
    if let Some(template) = &options.filename_template {
        let name = sanitize(template);
        if !name.is_empty() {
            return name;
        }
    }

    if let Some(suggested) = suggested {
        let name = sanitize(suggested);
        if !name.is_empty() {
            return name;
        }
    }

    if let Some(name) = url_basename(url) {
        return name;
    }

    format!("download_{}", Utc::now().timestamp())
}

/// The last non-empty path segment of the URL, sanitized, or `None` when the
/// path has no usable basename.
pub fn url_basename(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    let decoded = percent_decode(segment);
    let name = sanitize(&decoded);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

/// Strip path separators and control characters, collapse whitespace at the
/// edges, and bound the length.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    let mut result: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    // Don't leave a name that is only underscores.
    if result.chars().all(|c| c == '_') {
        result.clear();
    }
    result
}

/// Minimal percent-decoding for path segments; invalid escapes pass through.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &segment[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the filename out of a Content-Disposition header value.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn url_basename_wins_by_default() {
        let url = parse("https://example.com/media/My%20Video.mp4?token=x");
        let name = generate_filename(&url, &DownloadOptions::default(), None);
        assert_eq!(name, "My Video.mp4");
    }

    #[test]
    fn template_overrides_url_name() {
        let url = parse("https://example.com/media/clip.mp4");
        let options = DownloadOptions {
            filename_template: Some("episode-01.mp4".to_string()),
            ..Default::default()
        };
        assert_eq!(generate_filename(&url, &options, None), "episode-01.mp4");
    }

    #[test]
    fn suggested_name_beats_url_basename() {
        let url = parse("https://example.com/dl?id=42");
        let name = generate_filename(&url, &DownloadOptions::default(), Some("report.pdf"));
        assert_eq!(name, "report.pdf");
    }

    #[test]
    fn bare_host_falls_back_to_timestamp_scheme() {
        let url = parse("https://example.com/");
        let name = generate_filename(&url, &DownloadOptions::default(), None);
        assert!(name.starts_with("download_"), "got {name}");
    }

    #[test]
    fn sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize("  name.mp4  "), "name.mp4");
        assert_eq!(sanitize("..."), "");
    }

    #[test]
    fn content_disposition_parsing() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"movie.mkv\""),
            Some("movie.mkv".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=plain.bin"),
            Some("plain.bin".to_string())
        );
        assert_eq!(filename_from_content_disposition("inline"), None);
    }
}
