//! HLS (M3U8) support: playlist parsing and the segment downloader.

mod downloader;
pub mod playlist;

pub use downloader::{HlsDownloader, segment_scratch_path};
pub use playlist::{
    HlsByteRange, HlsKey, HlsPlaylist, HlsSegment, PlaylistInfo, fetch_playlist,
    parse_media_playlist,
};
