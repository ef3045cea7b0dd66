//! Segmented HTTP(S) downloader: HEAD preflight, strategy selection,
//! resumable single-stream and parallel byte-range paths.

pub mod filename;
pub mod probe;
pub mod ranged;
pub(crate) mod single;

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::{Client, header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::client::{create_client, load_cookie_header};
use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::limiter::RateLimiter;
use crate::options::DownloadOptions;
use crate::progress::ProgressReporter;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::task::{PauseGate, TaskControl};

pub use probe::Preflight;
pub use ranged::{ByteSegment, plan_segments};

/// Resources larger than this go parallel when the server supports ranges.
pub const SEGMENTED_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Shared cancel/pause/rate discipline applied between chunks.
#[derive(Clone)]
pub(crate) struct TransferGovernor {
    pub token: CancellationToken,
    pub pause: PauseGate,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl TransferGovernor {
    /// Gate one chunk: observe cancellation, block while paused, then spend
    /// rate-limiter tokens for the chunk length.
    pub async fn admit(&self, len: usize) -> Result<(), DownloadError> {
        if self.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        self.pause.wait_until_resumed(&self.token).await?;
        if let Some(limiter) = &self.limiter {
            tokio::select! {
                _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
                _ = limiter.acquire(len as u64) => {}
            }
        }
        Ok(())
    }
}

/// Result of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub output_path: PathBuf,
    /// Final size of the output file.
    pub file_size: u64,
    /// Remote size when the server reported one.
    pub total_size: Option<u64>,
}

/// Downloads one byte-addressable HTTP resource to a single output file.
pub struct HttpDownloader {
    client: Client,
    options: DownloadOptions,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpDownloader {
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        let mut config = DownloaderConfig::from_options(&options);
        if let Some(cookies) = &options.cookies_file
            && let Some(value) = load_cookie_header(cookies)
        {
            config.headers.insert(header::COOKIE, value);
        }
        let client = create_client(&config)?;
        let limiter = options
            .speed_limit_bytes()
            .map(|rate| Arc::new(RateLimiter::new(rate as f64)));
        Ok(Self {
            client,
            options,
            limiter,
        })
    }

    /// Share a rate limiter with other downloads instead of the per-task one.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// HEAD preflight for strategy selection and metadata.
    pub async fn probe(&self, url: &str) -> Result<Preflight, DownloadError> {
        let parsed = parse_http_url(url)?;
        probe::probe(&self.client, &parsed).await
    }

    /// Run the download to completion, honoring the task's control handles.
    #[instrument(skip(self, control, reporter), fields(url = %url))]
    pub async fn run(
        &self,
        url: &str,
        control: &TaskControl,
        reporter: &ProgressReporter,
    ) -> Result<DownloadOutcome, DownloadError> {
        if control.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let parsed = parse_http_url(url)?;
        tokio::fs::create_dir_all(&self.options.output_path).await?;

        let preflight = match probe::probe(&self.client, &parsed).await {
            Ok(preflight) => preflight,
            Err(e) => {
                debug!(error = %e, "Preflight failed; falling back to single stream");
                Preflight::default()
            }
        };

        let name = filename::generate_filename(
            &parsed,
            &self.options,
            preflight.suggested_filename.as_deref(),
        );
        let output = self.options.output_path.join(&name);

        if self.options.overwrite_existing && tokio::fs::try_exists(&output).await? {
            tokio::fs::remove_file(&output).await?;
        }

        let mut resume_position = if self.options.enable_resume {
            tokio::fs::metadata(&output)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        if let Some(total) = preflight.total_size {
            if resume_position == total && total > 0 {
                info!(output = %output.display(), "Output already complete");
                reporter.report(total, Some(total));
                return Ok(DownloadOutcome {
                    output_path: output,
                    file_size: total,
                    total_size: Some(total),
                });
            }
            if resume_position > total {
                // The file on disk is not a prefix of this resource.
                warn!(
                    output = %output.display(),
                    existing = resume_position,
                    total,
                    "Existing file larger than remote; restarting"
                );
                tokio::fs::remove_file(&output).await?;
                resume_position = 0;
            }
        }

        let policy = RetryPolicy::from_options(&self.options);
        let use_ranged = self.options.enable_segmented_download
            && preflight.supports_range
            && preflight.total_size.is_some_and(|total| total > SEGMENTED_THRESHOLD);

        if use_ranged {
            let total = preflight.total_size.expect("checked above");
            debug!(
                total,
                segments = self.options.max_concurrent_segments(),
                "Using parallel range strategy"
            );
            match ranged::download_ranged(
                &self.client,
                &parsed,
                &output,
                resume_position,
                total,
                self.options.max_concurrent_segments(),
                &policy,
                control,
                self.limiter.clone(),
                reporter,
            )
            .await
            {
                Ok(file_size) => {
                    return Ok(DownloadOutcome {
                        output_path: output,
                        file_size,
                        total_size: Some(total),
                    });
                }
                Err(DownloadError::RangeNotSupported { .. }) => {
                    warn!(url = %parsed, "Server refused ranges; downgrading to single stream");
                }
                Err(e) => return Err(e),
            }
        }

        let file_size = self
            .run_single_stream(&parsed, &output, preflight.total_size, &policy, control, reporter)
            .await?;

        Ok(DownloadOutcome {
            output_path: output,
            file_size,
            total_size: preflight.total_size,
        })
    }

    async fn run_single_stream(
        &self,
        url: &Url,
        output: &std::path::Path,
        total_size: Option<u64>,
        policy: &RetryPolicy,
        control: &TaskControl,
        reporter: &ProgressReporter,
    ) -> Result<u64, DownloadError> {
        let governor = TransferGovernor {
            token: control.cancel.clone(),
            pause: control.pause.clone(),
            limiter: self.limiter.clone(),
        };
        let enable_resume = self.options.enable_resume;

        retry_with_backoff(policy, &control.cancel, |attempt| {
            let governor = governor.clone();
            let reporter = reporter.clone();
            async move {
                // Re-stat each attempt: a failed attempt leaves a longer
                // partial file to continue from.
                let resume_position = if enable_resume {
                    tokio::fs::metadata(output)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0)
                } else {
                    0
                };
                if attempt > 0 {
                    debug!(attempt, resume_position, "Retrying single-stream download");
                }
                let result = single::stream_to_file(
                    &self.client,
                    single::StreamRequest {
                        url,
                        output,
                        resume_position,
                        byte_range: None,
                    },
                    &governor,
                    |cumulative| reporter.report(cumulative, total_size),
                )
                .await;
                RetryAction::from(result)
            }
        })
        .await
    }
}

fn parse_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url)
        .map_err(|e| DownloadError::invalid_input(url, format!("malformed URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(DownloadError::invalid_input(
            url,
            format!("unsupported scheme `{scheme}`"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        assert!(parse_http_url("ftp://example.com/file.bin").is_err());
        assert!(parse_http_url("not a url").is_err());
        assert!(parse_http_url("https://example.com/file.bin").is_ok());
    }

    #[tokio::test]
    async fn governor_rejects_after_cancel() {
        let control = TaskControl::new();
        let governor = TransferGovernor {
            token: control.cancel.clone(),
            pause: control.pause.clone(),
            limiter: None,
        };
        assert!(governor.admit(1024).await.is_ok());
        control.cancel.cancel();
        assert!(matches!(
            governor.admit(1024).await,
            Err(DownloadError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn governor_spends_limiter_tokens() {
        let control = TaskControl::new();
        let limiter = Arc::new(RateLimiter::new(1_000_000.0));
        let governor = TransferGovernor {
            token: control.cancel.clone(),
            pause: control.pause.clone(),
            limiter: Some(Arc::clone(&limiter)),
        };
        let before = limiter.current_tokens();
        governor.admit(8192).await.unwrap();
        assert!(limiter.current_tokens() <= before - 8000.0);
    }
}
