//! Shared upstream HTTP client

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::{ProxyError, Result};

/// Upstream HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Total request timeout in seconds. Applies to the entire request
    /// including streaming responses, so it must accommodate long
    /// generations.
    pub timeout_secs: u64,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum number of idle connections per host.
    pub pool_max_idle_per_host: usize,

    /// User agent string.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            user_agent: format!("llmtap/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create the process-wide upstream client with connection pooling.
pub fn create_client(config: &HttpClientConfig) -> Result<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        // Expire idle connections before upstream servers close them, or the
        // pool hands out dead sockets and requests hang
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        // Keep long-running streamed requests alive through firewalls
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.user_agent.starts_with("llmtap/"));
    }

    #[test]
    fn test_create_client() {
        let config = HttpClientConfig::default();
        assert!(create_client(&config).is_ok());
    }

    #[test]
    fn test_create_client_custom_config() {
        let config = HttpClientConfig {
            timeout_secs: 60,
            connect_timeout_secs: 5,
            pool_max_idle_per_host: 8,
            user_agent: "test/1.0".to_string(),
        };
        assert!(create_client(&config).is_ok());
    }
}
