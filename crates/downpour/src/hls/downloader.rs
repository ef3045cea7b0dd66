//! HLS downloader: enumerate playlist segments, download them under the
//! shared rate/pause/cancel discipline, then concatenate in playlist order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use reqwest::{Client, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::client::{create_client, load_cookie_header};
use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::hls::playlist::{HlsPlaylist, HlsSegment, fetch_playlist};
use crate::http::filename::generate_filename;
use crate::http::single::{StreamRequest, stream_to_file};
use crate::http::{DownloadOutcome, TransferGovernor};
use crate::limiter::RateLimiter;
use crate::options::DownloadOptions;
use crate::progress::ProgressReporter;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::task::TaskControl;

/// Copy buffer for the scratch-to-output concatenation.
const CONCAT_BUF_SIZE: usize = 64 * 1024;

/// Scratch file name for segment `index`: `<stem>_segment_<6 digits>.ts`.
pub fn segment_scratch_path(dir: &Path, stem: &str, index: usize) -> PathBuf {
    dir.join(format!("{stem}_segment_{index:06}.ts"))
}

/// Downloads an HLS (M3U8) stream to a single concatenated file.
///
/// Progress is reported in segments: `percentage = completed / total`. The
/// byte counter still carries real bytes, but `total_bytes` stays unknown so
/// the aggregate tracker never mixes segment counts into byte totals.
pub struct HlsDownloader {
    client: Client,
    options: DownloadOptions,
    limiter: Option<Arc<RateLimiter>>,
}

impl HlsDownloader {
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

    /// Fetch and parse the playlist without downloading anything.
    pub async fn playlist(&self, url: &str) -> Result<HlsPlaylist, DownloadError> {
        fetch_playlist(&self.client, url).await
    }

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

        let playlist = fetch_playlist(&self.client, url).await?;
        let total = playlist.segments.len();
        if playlist.live {
            info!(segments = total, "Playlist is live; downloading current snapshot");
        }

        tokio::fs::create_dir_all(&self.options.output_path).await?;

        let parsed = Url::parse(url)
            .map_err(|e| DownloadError::invalid_input(url, format!("malformed URL: {e}")))?;
        let name = generate_filename(&parsed, &self.options, None);
        let stem = Path::new(&name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("stream")
            .to_string();
        let output = self.options.output_path.join(format!("{stem}.ts"));

        // Resume: skip the run of scratch segments already on disk.
        let mut skip = 0usize;
        let mut resumed_bytes = 0u64;
        if self.options.enable_resume {
            for index in 0..total {
                let scratch = segment_scratch_path(&self.options.output_path, &stem, index);
                match tokio::fs::metadata(&scratch).await {
                    Ok(meta) if meta.len() > 0 => {
                        skip += 1;
                        resumed_bytes += meta.len();
                    }
                    _ => break,
                }
            }
            if skip > 0 {
                debug!(skip, total, "Resuming from existing scratch segments");
            }
        }

        let downloaded = Arc::new(AtomicU64::new(resumed_bytes));
        let completed = Arc::new(AtomicUsize::new(skip));
        reporter.report_percentage(
            downloaded.load(Ordering::Relaxed),
            None,
            percentage(skip, total),
        );

        if skip < total {
            self.fetch_segments(
                &playlist.segments[skip..],
                skip,
                total,
                &stem,
                control,
                reporter,
                &downloaded,
                &completed,
            )
            .await?;
        }

        if !self.options.m3u8_merge_segments {
            return Ok(DownloadOutcome {
                output_path: self.options.output_path.clone(),
                file_size: downloaded.load(Ordering::Relaxed),
                total_size: None,
            });
        }

        let file_size = self.concatenate(&stem, total, &output).await?;
        reporter.report_percentage(file_size, None, 100.0);
        info!(output = %output.display(), size = file_size, "HLS download complete");
        Ok(DownloadOutcome {
            output_path: output,
            file_size,
            total_size: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_segments(
        &self,
        segments: &[HlsSegment],
        skip: usize,
        total: usize,
        stem: &str,
        control: &TaskControl,
        reporter: &ProgressReporter,
        downloaded: &Arc<AtomicU64>,
        completed: &Arc<AtomicUsize>,
    ) -> Result<(), DownloadError> {
        let policy = RetryPolicy::from_options(&self.options);
        let threads = self.options.m3u8_segment_threads();

        if threads == 1 {
            // Sequential path: strict playlist order, fail at the first
            // segment that exhausts its retries.
            let governor = TransferGovernor {
                token: control.cancel.clone(),
                pause: control.pause.clone(),
                limiter: self.limiter.clone(),
            };
            for (offset, segment) in segments.iter().enumerate() {
                let index = skip + offset;
                let scratch = segment_scratch_path(&self.options.output_path, stem, index);
                if let Err(err) = fetch_one_segment(
                    &self.client,
                    segment,
                    &scratch,
                    &policy,
                    &governor,
                    reporter,
                    downloaded,
                    completed,
                    total,
                )
                .await
                {
                    warn!(error = %err, "HLS download failed; scratch segments preserved");
                    return Err(err);
                }
            }
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(threads));
        // First failure stops the sibling workers without touching the
        // task-level token.
        let abort = control.cancel.child_token();

        let mut workers: JoinSet<Result<(), DownloadError>> = JoinSet::new();
        for (offset, segment) in segments.iter().enumerate() {
            let index = skip + offset;
            let segment = segment.clone();
            let scratch = segment_scratch_path(&self.options.output_path, stem, index);
            let client = self.client.clone();
            let policy = policy.clone();
            let semaphore = Arc::clone(&semaphore);
            let governor = TransferGovernor {
                token: abort.clone(),
                pause: control.pause.clone(),
                limiter: self.limiter.clone(),
            };
            let reporter = reporter.clone();
            let downloaded = Arc::clone(downloaded);
            let completed = Arc::clone(completed);

            workers.spawn(async move {
                let _permit = tokio::select! {
                    _ = governor.token.cancelled() => return Err(DownloadError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| DownloadError::internal("segment semaphore closed"))?
                    }
                };
                fetch_one_segment(
                    &client,
                    &segment,
                    &scratch,
                    &policy,
                    &governor,
                    &reporter,
                    &downloaded,
                    &completed,
                    total,
                )
                .await
            });
        }

        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    Err(DownloadError::internal("HLS segment worker panicked"))
                }
                Err(_) => Err(DownloadError::Cancelled),
            };
            if let Err(err) = result {
                abort.cancel();
                let replace = match &failure {
                    None => true,
                    Some(DownloadError::Cancelled) => !matches!(err, DownloadError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => {
                warn!(error = %err, "HLS download failed; scratch segments preserved");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Concatenate scratch segments in playlist order, deleting each one
    /// after it is fully drained.
    async fn concatenate(
        &self,
        stem: &str,
        total: usize,
        output: &Path,
    ) -> Result<u64, DownloadError> {
        let mut out = tokio::fs::File::create(output).await?;
        let mut written = 0u64;
        let mut buf = vec![0u8; CONCAT_BUF_SIZE];
        for index in 0..total {
            let scratch = segment_scratch_path(&self.options.output_path, stem, index);
            let mut reader = tokio::fs::File::open(&scratch).await?;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            drop(reader);
            tokio::fs::remove_file(&scratch).await?;
        }
        out.flush().await?;
        Ok(written)
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one_segment(
    client: &Client,
    segment: &HlsSegment,
    scratch: &Path,
    policy: &RetryPolicy,
    governor: &TransferGovernor,
    reporter: &ProgressReporter,
    downloaded: &Arc<AtomicU64>,
    completed: &Arc<AtomicUsize>,
    total: usize,
) -> Result<(), DownloadError> {
    let url = Url::parse(&segment.uri).map_err(|e| {
        DownloadError::playlist_invalid(format!("invalid segment URI `{}`: {e}", segment.uri))
    })?;
    let byte_range = segment
        .byte_range
        .filter(|range| range.length > 0)
        .map(|range| {
            let start = range.offset.unwrap_or(0);
            (start, start + range.length - 1)
        });

    retry_with_backoff(policy, &governor.token, |attempt| {
        let url = url.clone();
        let governor = governor.clone();
        let reporter = reporter.clone();
        let downloaded = Arc::clone(downloaded);
        let completed = Arc::clone(completed);
        async move {
            if attempt > 0 {
                debug!(sequence = segment.sequence, attempt, "Retrying HLS segment");
            }
            // Each attempt rewrites the scratch file from the start.
            let mut reported = 0u64;
            let result = stream_to_file(
                client,
                StreamRequest {
                    url: &url,
                    output: scratch,
                    resume_position: 0,
                    byte_range,
                },
                &governor,
                |cumulative| {
                    if cumulative > reported {
                        let bytes = downloaded.fetch_add(cumulative - reported, Ordering::Relaxed)
                            + (cumulative - reported);
                        reported = cumulative;
                        reporter.report_percentage(
                            bytes,
                            None,
                            percentage(completed.load(Ordering::Relaxed), total),
                        );
                    }
                },
            )
            .await;
            match result {
                Ok(_written) => {
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    reporter.report_percentage(
                        downloaded.load(Ordering::Relaxed),
                        None,
                        percentage(done, total),
                    );
                    RetryAction::Success(())
                }
                Err(err) => {
                    // Roll the partial attempt back out of the shared counter
                    // so a retry does not double count.
                    if reported > 0 {
                        downloaded.fetch_sub(reported, Ordering::Relaxed);
                    }
                    RetryAction::from(Err::<(), _>(err))
                }
            }
        }
    })
    .await
}

fn percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64) * 100.0
}
