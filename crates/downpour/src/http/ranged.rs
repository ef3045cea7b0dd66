//! Parallel byte-range download: segment planning, per-segment workers with
//! scratch files, and the ordered merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::error::DownloadError;
use crate::http::TransferGovernor;
use crate::http::single::{StreamRequest, stream_to_file};
use crate::limiter::RateLimiter;
use crate::progress::ProgressReporter;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::task::TaskControl;

/// Copy buffer for draining scratch files into the output.
const MERGE_BUF_SIZE: usize = 64 * 1024;

/// A byte interval `[start, end]` (inclusive) of a known-length resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSegment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ByteSegment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Scratch file path: `<output>.part<i>`.
    pub fn scratch_path(&self, output: &Path) -> PathBuf {
        scratch_path_for(output, self.index)
    }
}

pub fn scratch_path_for(output: &Path, index: usize) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(format!(".part{index}"));
    PathBuf::from(name)
}

/// Partition `[resume_position, total_size - 1]` into `segment_count`
/// contiguous intervals. The last segment absorbs the remainder. Returns an
/// empty plan when nothing remains; degenerate counts are clamped so every
/// segment owns at least one byte.
pub fn plan_segments(resume_position: u64, total_size: u64, segment_count: usize) -> Vec<ByteSegment> {
    let remaining = total_size.saturating_sub(resume_position);
    if remaining == 0 {
        return Vec::new();
    }
    let count = (segment_count.max(1) as u64).min(remaining);
    let seg_size = remaining / count;
    (0..count)
        .map(|i| {
            let start = resume_position + i * seg_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                resume_position + (i + 1) * seg_size - 1
            };
            ByteSegment {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// Download `[resume_position, total_size)` of `url` via parallel range
/// segments, then merge scratch files into `output` in index order.
///
/// On failure the scratch files stay on disk; a later attempt with the same
/// resume position and segment count resumes each of them.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn download_ranged(
    client: &Client,
    url: &Url,
    output: &Path,
    resume_position: u64,
    total_size: u64,
    segment_count: usize,
    policy: &RetryPolicy,
    control: &TaskControl,
    limiter: Option<Arc<RateLimiter>>,
    reporter: &ProgressReporter,
) -> Result<u64, DownloadError> {
    let segments = plan_segments(resume_position, total_size, segment_count);
    if segments.is_empty() {
        return Ok(resume_position);
    }

    // Seed the shared counter with whatever previous attempts left in the
    // scratch files, so progress starts where the last run stopped.
    let mut base = resume_position;
    for segment in &segments {
        let existing = scratch_len(&segment.scratch_path(output)).await;
        base += existing.min(segment.len());
    }
    let counter = Arc::new(AtomicU64::new(base));
    reporter.report(counter.load(Ordering::Relaxed), Some(total_size));

    // Child token: the first hard failure stops the sibling segments while
    // leaving the task-level token untouched.
    let abort = control.cancel.child_token();

    let mut workers: JoinSet<Result<(), DownloadError>> = JoinSet::new();
    for segment in segments.iter().copied() {
        let client = client.clone();
        let url = url.clone();
        let scratch = segment.scratch_path(output);
        let policy = policy.clone();
        let governor = TransferGovernor {
            token: abort.clone(),
            pause: control.pause.clone(),
            limiter: limiter.clone(),
        };
        let counter = Arc::clone(&counter);
        let reporter = reporter.clone();

        workers.spawn(async move {
            retry_with_backoff(&policy, &governor.token, |attempt| {
                let client = client.clone();
                let url = url.clone();
                let scratch = scratch.clone();
                let governor = governor.clone();
                let counter = Arc::clone(&counter);
                let reporter = reporter.clone();
                async move {
                    let existing = scratch_len(&scratch).await;
                    if existing >= segment.len() {
                        return RetryAction::Success(());
                    }
                    if attempt > 0 {
                        debug!(index = segment.index, attempt, "Retrying range segment");
                    }
                    let mut reported = existing;
                    let result = stream_to_file(
                        &client,
                        StreamRequest {
                            url: &url,
                            output: &scratch,
                            resume_position: existing,
                            byte_range: Some((segment.start, segment.end)),
                        },
                        &governor,
                        |cumulative| {
                            if cumulative > reported {
                                let total =
                                    counter.fetch_add(cumulative - reported, Ordering::Relaxed)
                                        + (cumulative - reported);
                                reported = cumulative;
                                reporter.report(total, Some(total_size));
                            }
                        },
                    )
                    .await;
                    match result {
                        Ok(written) if written >= segment.len() => RetryAction::Success(()),
                        Ok(written) => RetryAction::Retry(DownloadError::internal(format!(
                            "segment {} truncated: {written} of {} bytes",
                            segment.index,
                            segment.len()
                        ))),
                        Err(err) => RetryAction::from(Err::<(), _>(err)),
                    }
                }
            })
            .await
        });
    }

    let mut failure: Option<DownloadError> = None;
    while let Some(joined) = workers.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(DownloadError::internal("range segment worker panicked"))
            }
            Err(_) => Err(DownloadError::Cancelled),
        };
        if let Err(err) = result {
            abort.cancel();
            let replace = match &failure {
                None => true,
                // A sibling's real error beats the Cancelled noise it caused.
                Some(DownloadError::Cancelled) => !matches!(err, DownloadError::Cancelled),
                Some(_) => false,
            };
            if replace {
                failure = Some(err);
            }
        }
    }

    if let Some(err) = failure {
        warn!(url = %url, error = %err, "Parallel range download failed; scratch preserved");
        return Err(err);
    }

    let merged = merge_segments(output, resume_position, &segments).await?;
    if merged != total_size {
        return Err(DownloadError::SizeMismatch {
            expected: total_size,
            actual: merged,
        });
    }
    reporter.report(total_size, Some(total_size));
    Ok(total_size)
}

async fn scratch_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Drain scratch files into the output in index order, deleting each one
/// once fully copied. Returns the resulting output size.
async fn merge_segments(
    output: &Path,
    resume_position: u64,
    segments: &[ByteSegment],
) -> Result<u64, DownloadError> {
    let mut out = if resume_position > 0 {
        OpenOptions::new().append(true).create(true).open(output).await?
    } else {
        tokio::fs::File::create(output).await?
    };

    let mut total = resume_position;
    let mut buf = vec![0u8; MERGE_BUF_SIZE];
    for segment in segments {
        let scratch = segment.scratch_path(output);
        let mut reader = tokio::fs::File::open(&scratch).await?;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        drop(reader);
        tokio::fs::remove_file(&scratch).await?;
    }
    out.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_partition_exactly() {
        for (total, count) in [
            (41_943_040u64, 4usize),
            (1000, 3),
            (10, 4),
            (1, 1),
            (7, 16),
        ] {
            let segments = plan_segments(0, total, count);
            assert!(!segments.is_empty());
            assert_eq!(segments[0].start, 0);
            assert_eq!(segments.last().unwrap().end, total - 1);
            for pair in segments.windows(2) {
                assert_eq!(pair[0].end + 1, pair[1].start, "boundaries contiguous");
            }
            let sum: u64 = segments.iter().map(|s| s.len()).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn forty_mib_in_four_segments_matches_expected_boundaries() {
        let segments = plan_segments(0, 41_943_040, 4);
        let bounds: Vec<(u64, u64)> = segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(
            bounds,
            vec![
                (0, 10_485_759),
                (10_485_760, 20_971_519),
                (20_971_520, 31_457_279),
                (31_457_280, 41_943_039),
            ]
        );
    }

    #[test]
    fn resume_position_shifts_the_partition() {
        let resume = 5 * 1024 * 1024;
        let total = 40 * 1024 * 1024;
        let segments = plan_segments(resume, total, 4);
        assert_eq!(segments[0].start, resume);
        assert_eq!(segments.last().unwrap().end, total - 1);
        let sum: u64 = segments.iter().map(|s| s.len()).sum();
        assert_eq!(sum, total - resume);
    }

    #[test]
    fn fully_resumed_download_yields_empty_plan() {
        assert!(plan_segments(1000, 1000, 4).is_empty());
    }

    #[test]
    fn tiny_remainder_clamps_segment_count() {
        let segments = plan_segments(0, 3, 8);
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert_eq!(segment.len(), 1);
        }
    }

    #[test]
    fn scratch_paths_are_indexed() {
        let segment = ByteSegment {
            index: 2,
            start: 0,
            end: 9,
        };
        let path = segment.scratch_path(Path::new("/tmp/video.mp4"));
        assert_eq!(path, PathBuf::from("/tmp/video.mp4.part2"));
    }

    #[tokio::test]
    async fn merge_concatenates_in_index_order_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        let segments = plan_segments(0, 6, 3);
        for (segment, data) in segments.iter().zip([b"ab", b"cd", b"ef"]) {
            tokio::fs::write(segment.scratch_path(&output), data)
                .await
                .unwrap();
        }

        let merged = merge_segments(&output, 0, &segments).await.unwrap();
        assert_eq!(merged, 6);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"abcdef");
        for segment in &segments {
            assert!(!segment.scratch_path(&output).exists());
        }
    }

    #[tokio::test]
    async fn merge_appends_after_resume_position() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        tokio::fs::write(&output, b"01").await.unwrap();

        let segments = plan_segments(2, 6, 2);
        for (segment, data) in segments.iter().zip([b"ab", b"cd"]) {
            tokio::fs::write(segment.scratch_path(&output), data)
                .await
                .unwrap();
        }

        let merged = merge_segments(&output, 2, &segments).await.unwrap();
        assert_eq!(merged, 6);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"01abcd");
    }
}
