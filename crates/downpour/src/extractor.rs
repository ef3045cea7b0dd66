//! Boundary to platform-specific extractors.
//!
//! Extractors are opaque collaborators that turn a platform page URL into
//! resolved direct media URLs plus human-readable metadata. Their internal
//! HTML/API logic lives outside this crate; the manager only consumes this
//! narrow interface.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DownloadError;

/// Human-readable metadata about a media item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    /// The page or resource URL the metadata describes.
    pub source_url: String,
    pub uploader: Option<String>,
    pub duration_secs: Option<f64>,
    pub thumbnail_url: Option<String>,
    pub file_size: Option<u64>,
    pub format: Option<String>,
}

impl MediaMetadata {
    /// Minimal metadata synthesized from the URL alone, used when no
    /// extractor matches or extraction fails.
    pub fn synthesized(url: &str) -> Self {
        let title = Url::parse(url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| url.to_string());
        Self {
            title,
            source_url: url.to_string(),
            uploader: None,
            duration_secs: None,
            thumbnail_url: None,
            file_size: None,
            format: None,
        }
    }
}

/// One downloadable rendition of the media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFormat {
    pub url: String,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub audio_only: bool,
}

/// Structured extraction result: metadata plus the available renditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedInfo {
    pub metadata: MediaMetadata,
    pub formats: Vec<MediaFormat>,
    /// Platform-specific extras (request headers, tokens, ...).
    pub extras: HashMap<String, String>,
}

/// A site-specific metadata/URL provider.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap URL-shape check; no network.
    fn can_handle(&self, url: &str) -> bool;

    async fn metadata(&self, url: &str) -> Result<MediaMetadata, DownloadError>;

    async fn extract(&self, url: &str) -> Result<ExtractedInfo, DownloadError>;

    /// Resolved direct media URLs for the extracted info, best first.
    fn download_urls(&self, info: &ExtractedInfo) -> Vec<String> {
        info.formats.iter().map(|f| f.url.clone()).collect()
    }
}
