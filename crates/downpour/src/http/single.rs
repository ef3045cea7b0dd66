//! Single-stream chunk loop shared by plain downloads, resume, byte-range
//! segments and HLS segment fetches.

use std::path::Path;

use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::DownloadError;
use crate::http::TransferGovernor;

/// One streaming GET written to a file.
pub(crate) struct StreamRequest<'a> {
    pub url: &'a Url,
    pub output: &'a Path,
    /// Bytes already present in `output`; the request resumes past them and
    /// the file is opened for append.
    pub resume_position: u64,
    /// Remote byte range (inclusive) when fetching a sub-resource. Combined
    /// with `resume_position`: the request starts at `start + resume`.
    pub byte_range: Option<(u64, u64)>,
}

/// Stream the response body to disk under the governor's cancel/pause/rate
/// discipline. Returns the cumulative byte count now present in the file.
///
/// A 200 response to a resumed request means the server ignored the range;
/// the file is truncated and rewritten from the start. A 200 response to an
/// explicit byte-range request is a hard `RangeNotSupported`.
pub(crate) async fn stream_to_file(
    client: &Client,
    request: StreamRequest<'_>,
    governor: &TransferGovernor,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, DownloadError> {
    let range_header = match (request.byte_range, request.resume_position) {
        (Some((start, end)), resume) => Some(format!("bytes={}-{end}", start + resume)),
        (None, resume) if resume > 0 => Some(format!("bytes={resume}-")),
        _ => None,
    };

    let mut builder = client.get(request.url.clone());
    if let Some(range) = &range_header {
        builder = builder.header(header::RANGE, range);
    }

    let response = tokio::select! {
        _ = governor.token.cancelled() => return Err(DownloadError::Cancelled),
        response = builder.send() => response?,
    };

    let status = response.status();
    let mut restart_from_zero = false;
    if status == StatusCode::OK {
        if request.byte_range.is_some() {
            return Err(DownloadError::RangeNotSupported {
                url: request.url.to_string(),
            });
        }
        // Server ignored our resume range and is sending the whole body.
        restart_from_zero = request.resume_position > 0;
    } else if status != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::http_status(
            status,
            request.url.as_str(),
            "streaming GET",
        ));
    }

    let append = request.resume_position > 0 && !restart_from_zero;
    let mut file = if append {
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(request.output)
            .await?
    } else {
        File::create(request.output).await?
    };

    let mut written = if append { request.resume_position } else { 0 };
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            _ = governor.token.cancelled() => {
                flush_best_effort(&mut file).await;
                return Err(DownloadError::Cancelled);
            }
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                flush_best_effort(&mut file).await;
                return Err(DownloadError::from(e));
            }
        };
        if let Err(e) = governor.admit(chunk.len()).await {
            flush_best_effort(&mut file).await;
            return Err(e);
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_progress(written);
    }

    file.flush().await?;
    Ok(written)
}

/// Keep the partial file intact when bailing out mid-stream.
async fn flush_best_effort(file: &mut File) {
    let _ = file.flush().await;
}
