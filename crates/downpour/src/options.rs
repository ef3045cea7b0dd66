use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyConfig, ProxyType};

/// Per-task configuration carried from submission to the downloader.
///
/// Fields outside their documented ranges are clamped by the accessors, not
/// at construction, so a deserialized options blob is never rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Directory to write the output into.
    pub output_path: PathBuf,

    /// Quality hint for the extractor path; ignored by the raw byte path.
    pub quality_preference: Option<String>,
    /// Container/format hint for the extractor path.
    pub format_preference: Option<String>,
    /// Prefer an audio-only stream when the extractor offers one.
    pub audio_only: bool,
    /// Subtitle languages to request from the extractor.
    pub subtitle_languages: Vec<String>,

    /// Continue from the size of an existing partial output file.
    pub enable_resume: bool,

    /// Allow multi-range parallel download when the server supports it.
    pub enable_segmented_download: bool,
    /// Parallel range segments, clamped to [1, 16].
    pub max_concurrent_segments: usize,

    /// Download speed cap in KiB/s. Installs a token-bucket limiter.
    pub speed_limit: Option<u64>,

    pub proxy_url: Option<String>,
    pub proxy_type: Option<ProxyType>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,

    pub user_agent: Option<String>,
    pub cookies_file: Option<PathBuf>,

    /// Task-level retry budget, clamped to [0, 10].
    pub retry_attempts: u32,
    /// Exponential backoff base in seconds: delay = retry_delay * 2^attempt.
    pub retry_delay_secs: f64,

    /// Explicit output filename; wins over the URL-derived name.
    pub filename_template: Option<String>,
    /// Delete a pre-existing completed output instead of resuming into it.
    pub overwrite_existing: bool,

    /// Concurrent HLS segment downloads, clamped to [1, 8].
    pub m3u8_segment_threads: usize,
    /// Concatenate HLS scratch segments into one file when done.
    pub m3u8_merge_segments: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("."),
            quality_preference: None,
            format_preference: None,
            audio_only: false,
            subtitle_languages: Vec::new(),
            enable_resume: true,
            enable_segmented_download: true,
            max_concurrent_segments: 4,
            speed_limit: None,
            proxy_url: None,
            proxy_type: None,
            proxy_username: None,
            proxy_password: None,
            user_agent: None,
            cookies_file: None,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            filename_template: None,
            overwrite_existing: false,
            m3u8_segment_threads: 1,
            m3u8_merge_segments: true,
        }
    }
}

impl DownloadOptions {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    /// Parallel range segments, clamped to [1, 16].
    pub fn max_concurrent_segments(&self) -> usize {
        self.max_concurrent_segments.clamp(1, 16)
    }

    /// Task-level retry budget, clamped to [0, 10].
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.min(10)
    }

    /// Backoff base as a duration. Negative or NaN values collapse to zero.
    pub fn retry_delay(&self) -> Duration {
        if self.retry_delay_secs.is_finite() && self.retry_delay_secs > 0.0 {
            Duration::from_secs_f64(self.retry_delay_secs)
        } else {
            Duration::ZERO
        }
    }

    /// Concurrent HLS segment downloads, clamped to [1, 8].
    pub fn m3u8_segment_threads(&self) -> usize {
        self.m3u8_segment_threads.clamp(1, 8)
    }

    /// Speed cap converted to bytes per second.
    pub fn speed_limit_bytes(&self) -> Option<u64> {
        self.speed_limit.filter(|kib| *kib > 0).map(|kib| kib * 1024)
    }

    /// Assemble the proxy configuration from the individual option fields.
    pub fn proxy_config(&self) -> Option<ProxyConfig> {
        let url = self.proxy_url.as_ref()?;
        let mut config = match self.proxy_type {
            Some(proxy_type) => ProxyConfig::new(url.clone(), proxy_type),
            None => ProxyConfig::from_url(url.clone()),
        };
        if let (Some(user), Some(pass)) = (&self.proxy_username, &self.proxy_password) {
            config = config.with_auth(user.clone(), pass.clone());
        }
        Some(config)
    }
}
