use reqwest::StatusCode;

/// Unified error type for the download engine.
///
/// Variants map onto the retry discipline: transient network failures are
/// retried at the stream/segment layer, permanent failures surface
/// immediately, and `Cancelled` short-circuits everything.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid input `{input}`: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("server refused byte range for {url}")]
    RangeNotSupported { url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid playlist: {reason}")]
    PlaylistInvalid { reason: String },

    #[error("playlist has no segments: {url}")]
    PlaylistEmpty { url: String },

    #[error("parse error: {reason}")]
    Parse { reason: String },

    #[error("merged output size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("extractor error: {reason}")]
    Extractor { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_input(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist_invalid(reason: impl Into<String>) -> Self {
        Self::PlaylistInvalid {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn extractor(reason: impl Into<String>) -> Self {
        Self::Extractor {
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth another attempt at the stream/segment
    /// layer. 4xx, malformed input and cancellation are final; timeouts,
    /// connection resets, body read errors and 5xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidInput { .. }
            | Self::PlaylistInvalid { .. }
            | Self::PlaylistEmpty { .. }
            | Self::Parse { .. }
            | Self::RangeNotSupported { .. }
            | Self::Io { .. }
            | Self::Extractor { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::SizeMismatch { .. } | Self::Internal { .. } => false,
        }
    }

    /// Permanent failures skip task-level retries too. Filesystem errors
    /// fail the task outright: retrying won't un-fill a disk or grant a
    /// permission.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_client_error() && *status != StatusCode::TOO_MANY_REQUESTS
            }
            Self::InvalidInput { .. }
            | Self::PlaylistInvalid { .. }
            | Self::PlaylistEmpty { .. }
            | Self::Parse { .. }
            | Self::Io { .. }
            | Self::Cancelled => true,
            _ => false,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
