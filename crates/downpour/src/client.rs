use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::HeaderValue;
use reqwest::redirect::Policy;
use tracing::warn;

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::proxy::build_proxy_from_config;

/// Build a reqwest client from the downloader configuration.
///
/// One client is built per download and shared across its range segments so
/// the connection pool (capped per host) is reused.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(config.pool_max_per_host)
        .pool_idle_timeout(config.pool_idle_timeout);

    if config.timeout > Duration::ZERO {
        builder = builder.timeout(config.timeout);
    }

    builder = if config.follow_redirects {
        builder.redirect(Policy::limited(10))
    } else {
        builder.redirect(Policy::none())
    };

    if let Some(proxy) = &config.proxy {
        builder = builder.proxy(build_proxy_from_config(proxy)?);
    }

    builder.build().map_err(DownloadError::from)
}

/// Read a Netscape-format cookies file into a `Cookie` header value.
///
/// Lines are tab-separated with the name and value in the last two fields;
/// comments and malformed lines are skipped. Returns `None` when the file is
/// unreadable or yields no cookies.
pub fn load_cookie_header(path: &Path) -> Option<HeaderValue> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cookies file");
            return None;
        }
    };

    let mut pairs = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() >= 7 {
            pairs.push(format!("{}={}", fields[5], fields[6]));
        } else if fields.len() == 1 && line.contains('=') {
            // Tolerate a plain "name=value; name2=value2" file.
            pairs.push(line.to_string());
        }
    }

    if pairs.is_empty() {
        return None;
    }
    HeaderValue::from_str(&pairs.join("; ")).ok()
}
