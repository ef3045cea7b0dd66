//! Downpour: a concurrent media-download engine.
//!
//! Given a URL and a set of options, the engine produces a local file whose
//! bytes match the remote resource, bounding bandwidth with a token bucket,
//! exploiting Range parallelism, surviving interruptions through resume,
//! and reporting live progress to observers.
//!
//! The [`DownloadManager`] is the embedding surface: submit URLs, observe
//! events, cancel/pause/resume tasks. The downloaders ([`HttpDownloader`],
//! [`HlsDownloader`]) are also usable standalone.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod hls;
pub mod http;
pub mod limiter;
pub mod manager;
pub mod options;
pub mod pool;
pub mod progress;
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod selector;
pub mod task;

// Re-exports for easier access
pub use config::{DownloaderConfig, DownloaderConfigBuilder, EngineSettings};
pub use error::DownloadError;
pub use events::{DownloadEvent, ObserverId};
pub use extractor::{ExtractedInfo, Extractor, MediaFormat, MediaMetadata};
pub use hls::{HlsDownloader, HlsPlaylist, HlsSegment};
pub use http::{DownloadOutcome, HttpDownloader, Preflight};
pub use limiter::{AdaptiveRateLimiter, BandwidthMonitor, RateLimiter};
pub use manager::{DownloadManager, ManagerStatistics};
pub use options::DownloadOptions;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use progress::{AggregateProgress, ProgressTracker, TaskProgress};
pub use proxy::{ProxyConfig, ProxyType};
pub use queue::{QueueSnapshot, TaskQueue};
pub use task::{Task, TaskPriority, TaskStatus};
