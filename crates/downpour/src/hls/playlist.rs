//! HLS playlist fetching and parsing.
//!
//! Master playlists resolve to the highest-bandwidth variant; media
//! playlists map into the engine's own segment model with absolute URIs and
//! assigned sequence numbers.

use m3u8_rs::{KeyMethod, MediaPlaylist, parse_playlist_res};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::DownloadError;

/// Byte range of a sub-resource segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

/// Encryption key descriptor attached to a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsKey {
    pub method: String,
    pub uri: Option<String>,
    pub iv: Option<String>,
}

/// One media segment with its URI resolved against the playlist URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsSegment {
    pub uri: String,
    pub duration: f32,
    pub title: Option<String>,
    pub byte_range: Option<HlsByteRange>,
    pub discontinuity: bool,
    pub key: Option<HlsKey>,
    pub program_date_time: Option<String>,
    pub sequence: u64,
}

/// Parsed media playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsPlaylist {
    /// URL the playlist was fetched from (the variant URL for masters).
    pub url: String,
    pub version: Option<usize>,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub end_list: bool,
    /// `!end_list`: the playlist may still be growing. Downloads treat live
    /// playlists as a best-effort snapshot.
    pub live: bool,
    pub segments: Vec<HlsSegment>,
}

/// Summary for callers that only need the shape of the playlist.
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistInfo {
    pub segment_count: usize,
    pub total_duration_secs: f64,
    pub target_duration: u64,
    pub live: bool,
}

impl HlsPlaylist {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration as f64).sum()
    }

    pub fn info(&self) -> PlaylistInfo {
        PlaylistInfo {
            segment_count: self.segments.len(),
            total_duration_secs: self.total_duration(),
            target_duration: self.target_duration,
            live: self.live,
        }
    }

    /// Minimal reserialization: header tags, `#EXTINF`/URI pairs and the
    /// endlist marker. Parsing the result yields the same URIs, durations
    /// and sequence numbering.
    pub fn to_m3u8(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        if let Some(version) = self.version {
            out.push_str(&format!("#EXT-X-VERSION:{version}\n"));
        }
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        for segment in &self.segments {
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            match &segment.title {
                Some(title) => out.push_str(&format!("#EXTINF:{},{title}\n", segment.duration)),
                None => out.push_str(&format!("#EXTINF:{},\n", segment.duration)),
            }
            out.push_str(&segment.uri);
            out.push('\n');
        }
        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

/// Fetch and parse a playlist. A master playlist is resolved to its
/// highest-`BANDWIDTH` variant, which is then fetched and parsed as the
/// media playlist.
pub async fn fetch_playlist(client: &Client, url: &str) -> Result<HlsPlaylist, DownloadError> {
    let playlist_url = Url::parse(url)
        .map_err(|e| DownloadError::invalid_input(url, format!("malformed playlist URL: {e}")))?;

    let bytes = fetch_bytes(client, &playlist_url).await?;
    match parse_playlist_res(&bytes) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => map_media_playlist(media, &playlist_url),
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
            let variant = master
                .variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| {
                    DownloadError::playlist_invalid("master playlist has no variant streams")
                })?;
            let variant_url = playlist_url.join(&variant.uri).map_err(|e| {
                DownloadError::playlist_invalid(format!(
                    "cannot resolve variant URI `{}`: {e}",
                    variant.uri
                ))
            })?;
            debug!(
                bandwidth = variant.bandwidth,
                url = %variant_url,
                "Selected highest-bandwidth variant"
            );
            let bytes = fetch_bytes(client, &variant_url).await?;
            match parse_playlist_res(&bytes) {
                Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                    map_media_playlist(media, &variant_url)
                }
                Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(DownloadError::playlist_invalid(
                    "variant URL resolved to another master playlist",
                )),
                Err(e) => Err(DownloadError::parse(format!(
                    "malformed media playlist: {e}"
                ))),
            }
        }
        Err(e) => Err(DownloadError::parse(format!("malformed playlist: {e}"))),
    }
}

/// Parse media playlist text against a base URL. Exposed for callers that
/// already hold the playlist body.
pub fn parse_media_playlist(content: &[u8], base_url: &Url) -> Result<HlsPlaylist, DownloadError> {
    match parse_playlist_res(content) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => map_media_playlist(media, base_url),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(DownloadError::playlist_invalid(
            "expected a media playlist, found a master playlist",
        )),
        Err(e) => Err(DownloadError::parse(format!("malformed playlist: {e}"))),
    }
}

async fn fetch_bytes(client: &Client, url: &Url) -> Result<Vec<u8>, DownloadError> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(
            status,
            url.as_str(),
            "playlist GET",
        ));
    }
    Ok(response.bytes().await?.to_vec())
}

fn map_media_playlist(
    playlist: MediaPlaylist,
    base_url: &Url,
) -> Result<HlsPlaylist, DownloadError> {
    if playlist.segments.is_empty() {
        return Err(DownloadError::PlaylistEmpty {
            url: base_url.to_string(),
        });
    }

    let media_sequence = playlist.media_sequence;
    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (i, segment) in playlist.segments.iter().enumerate() {
        let absolute = base_url.join(&segment.uri).map_err(|e| {
            DownloadError::playlist_invalid(format!(
                "cannot resolve segment URI `{}`: {e}",
                segment.uri
            ))
        })?;
        segments.push(HlsSegment {
            uri: absolute.to_string(),
            duration: segment.duration,
            title: segment.title.clone(),
            byte_range: segment.byte_range.as_ref().map(|range| HlsByteRange {
                length: range.length,
                offset: range.offset,
            }),
            discontinuity: segment.discontinuity,
            key: segment.key.as_ref().map(|key| HlsKey {
                method: key_method_name(&key.method),
                uri: key.uri.clone(),
                iv: key.iv.clone(),
            }),
            program_date_time: segment.program_date_time.map(|dt| dt.to_rfc3339()),
            sequence: media_sequence + i as u64,
        });
    }

    let end_list = playlist.end_list;
    Ok(HlsPlaylist {
        url: base_url.to_string(),
        version: playlist.version,
        target_duration: playlist.target_duration,
        media_sequence,
        end_list,
        live: !end_list,
        segments,
    })
}

fn key_method_name(method: &KeyMethod) -> String {
    match method {
        KeyMethod::None => "NONE".to_string(),
        KeyMethod::AES128 => "AES-128".to_string(),
        KeyMethod::SampleAES => "SAMPLE-AES".to_string(),
        KeyMethod::Other(name) => name.clone(),
    }
}
