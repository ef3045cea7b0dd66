use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::options::DownloadOptions;
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Default overall timeout for a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configurable HTTP-level options shared by all downloaders.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Maximum idle connections to keep per host.
    ///
    /// Sized to `max_concurrent_segments + 2` so parallel range segments of
    /// one download reuse connections instead of opening new ones.
    pub pool_max_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::default_headers(),
            proxy: None,
            pool_max_per_host: 6,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> DownloaderConfigBuilder {
        DownloaderConfigBuilder::new()
    }

    /// Derive the HTTP configuration carried by a task's options.
    pub fn from_options(options: &DownloadOptions) -> Self {
        let mut builder = Self::builder()
            .pool_max_per_host(options.max_concurrent_segments() + 2);
        if let Some(ua) = &options.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        if let Some(proxy) = options.proxy_config() {
            builder = builder.proxy(proxy);
        }
        builder.build()
    }

    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers
    }
}

/// Fluent builder for [`DownloaderConfig`].
#[derive(Debug, Default)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DownloaderConfig::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn pool_max_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_per_host = max.max(1);
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    pub fn build(self) -> DownloaderConfig {
        self.config
    }
}

/// Read-only settings the embedding application exposes to the engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineSettings {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_segments: usize,
    pub download_path: PathBuf,
    pub default_quality: Option<String>,
    pub default_format: Option<String>,
    pub enable_resume: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_concurrent_segments: 4,
            download_path: PathBuf::from("."),
            default_quality: None,
            default_format: None,
            enable_resume: true,
        }
    }
}
