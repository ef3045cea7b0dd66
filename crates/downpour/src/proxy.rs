use reqwest::Proxy;
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// Proxy configuration types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS4 proxy
    Socks4,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    /// Type of proxy (HTTP, HTTPS, SOCKS4, SOCKS5)
    pub proxy_type: ProxyType,
    /// Authentication for the proxy (optional)
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            url: url.into(),
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Infer the proxy type from a URL scheme. Unknown schemes default to HTTP.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let proxy_type = if url.starts_with("socks5://") || url.starts_with("socks5h://") {
            ProxyType::Socks5
        } else if url.starts_with("socks4://") || url.starts_with("socks4a://") {
            ProxyType::Socks4
        } else if url.starts_with("https://") {
            ProxyType::Https
        } else {
            ProxyType::Http
        };
        Self::new(url, proxy_type)
    }
}

/// Build a reqwest Proxy object from our proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let proxy_url = &config.url;

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url).map_err(|e| {
            DownloadError::invalid_input(proxy_url, format!("invalid HTTP proxy URL: {e}"))
        })?,
        ProxyType::Https => Proxy::https(proxy_url).map_err(|e| {
            DownloadError::invalid_input(proxy_url, format!("invalid HTTPS proxy URL: {e}"))
        })?,
        ProxyType::Socks4 => {
            let url = if proxy_url.starts_with("socks4://") || proxy_url.starts_with("socks4a://") {
                proxy_url.to_string()
            } else {
                format!("socks4://{proxy_url}")
            };
            Proxy::all(&url).map_err(|e| {
                DownloadError::invalid_input(&url, format!("invalid SOCKS4 proxy URL: {e}"))
            })?
        }
        ProxyType::Socks5 => {
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };
            Proxy::all(&url).map_err(|e| {
                DownloadError::invalid_input(&url, format!("invalid SOCKS5 proxy URL: {e}"))
            })?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_type_from_scheme() {
        assert_eq!(
            ProxyConfig::from_url("socks5://127.0.0.1:1080").proxy_type,
            ProxyType::Socks5
        );
        assert_eq!(
            ProxyConfig::from_url("socks4://127.0.0.1:1080").proxy_type,
            ProxyType::Socks4
        );
        assert_eq!(
            ProxyConfig::from_url("https://proxy:3128").proxy_type,
            ProxyType::Https
        );
        assert_eq!(
            ProxyConfig::from_url("http://proxy:8080").proxy_type,
            ProxyType::Http
        );
    }

    #[test]
    fn builds_socks5_proxy_with_auth() {
        let config =
            ProxyConfig::new("127.0.0.1:1080", ProxyType::Socks5).with_auth("user", "pass");
        assert!(build_proxy_from_config(&config).is_ok());
    }

    #[test]
    fn rejects_malformed_proxy_url() {
        let config = ProxyConfig::new("http://[::bad", ProxyType::Http);
        assert!(build_proxy_from_config(&config).is_err());
    }
}
