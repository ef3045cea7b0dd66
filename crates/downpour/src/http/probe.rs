//! HEAD preflight: size, range support and content type of a resource.

use reqwest::Client;
use reqwest::header;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::http::filename::filename_from_content_disposition;

/// What the preflight learned about the resource.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    pub total_size: Option<u64>,
    pub supports_range: bool,
    pub content_type: Option<String>,
    /// Filename suggested by Content-Disposition, if any.
    pub suggested_filename: Option<String>,
}

/// Issue a HEAD request and read the headers that drive strategy selection.
///
/// Callers fall back to a plain single-stream GET (size unknown) when this
/// fails; servers that block HEAD are common enough that a failure here is
/// not a task failure.
pub async fn probe(client: &Client, url: &Url) -> Result<Preflight, DownloadError> {
    let response = client.head(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(status, url.as_str(), "preflight HEAD"));
    }

    let headers = response.headers();
    let total_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    let supports_range = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or(value)
                .trim()
                .to_ascii_lowercase()
        });

    let suggested_filename = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(filename_from_content_disposition);

    let preflight = Preflight {
        total_size,
        supports_range,
        content_type,
        suggested_filename,
    };
    debug!(
        url = %url,
        size = ?preflight.total_size,
        range = preflight.supports_range,
        content_type = ?preflight.content_type,
        "Preflight complete"
    );
    Ok(preflight)
}
