//! Downloader strategy selection from URL shape and content type.

use url::Url;

/// Extensions handled directly by the segmented HTTP downloader.
pub const DIRECT_MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "wmv", "flv", "webm", "mp3", "wav", "flac", "aac", "ogg", "m4a",
    "ts", "mpd",
];

/// Content types that identify an HLS playlist.
pub const HLS_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
];

/// Which downloader drives a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderKind {
    /// M3U8 playlist download.
    Hls,
    /// Direct byte-addressable resource.
    Segmented,
}

/// Classify a URL by its path shape alone. `None` means the URL needs an
/// extractor or a content-type probe to decide.
pub fn classify_by_url(url: &str) -> Option<DownloaderKind> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => url.to_ascii_lowercase(),
    };
    if path.ends_with(".m3u8") {
        return Some(DownloaderKind::Hls);
    }
    let (_, extension) = path.rsplit_once('.')?;
    if DIRECT_MEDIA_EXTENSIONS.contains(&extension) {
        return Some(DownloaderKind::Segmented);
    }
    None
}

/// Whether an observed Content-Type identifies HLS.
pub fn is_hls_content_type(content_type: &str) -> bool {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    HLS_CONTENT_TYPES.contains(&normalized.as_str())
}
