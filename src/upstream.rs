//! HTTP client for tunnel backends
//!
//! Backends are reached through public HTTPS tunnel addresses, so a single
//! pooled reqwest client is shared by health probes and forwarded requests.

use hyper::body::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for upstream calls
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection, TLS or protocol failure
    #[error("transport error: {0}")]
    Transport(String),
    /// No complete response within the allowed time
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Statistics for upstream traffic
#[derive(Debug, Default)]
pub struct UpstreamStats {
    /// Total number of forwarded requests
    pub total_requests: AtomicU64,
    /// Forwarded requests that failed at the transport level
    pub failed_requests: AtomicU64,
    /// Total number of health probes
    pub health_checks: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A request to replay against a backend
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: hyper::Method,
    /// Full URL on the backend
    pub url: String,
    /// Headers to send, already stripped of hop-by-hop entries
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub timeout: Duration,
}

/// A fully received backend response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Pooled client for backend traffic
pub struct UpstreamClient {
    client: reqwest::Client,
    stats: Arc<UpstreamStats>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build upstream client: {}", e))?;

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Ok(Self {
            client,
            stats: Arc::new(UpstreamStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request and read the whole response body before returning
    pub async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_slice());
        }

        self.stats.record_request();

        let result = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(UpstreamResponse {
                status,
                content_type,
                body,
            })
        }
        .await;

        result.map_err(|e| {
            self.stats.record_failure();
            if e.is_timeout() {
                UpstreamError::Timeout(request.timeout)
            } else if e.is_builder() {
                UpstreamError::InvalidRequest(e.to_string())
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })
    }

    /// GET `url` and report whether it answered with a success status in time
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        self.stats.record_health_check();

        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!(url, status = response.status().as_u16(), "Probe returned non-success status");
                }
                ok
            }
            Err(e) => {
                debug!(url, error = %e, "Probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_config_default() {
        let config = UpstreamConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_stats() {
        let stats = UpstreamStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_health_check();

        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
        assert_eq!(stats.get_health_checks(), 1);
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_false() {
        let client = UpstreamClient::new(UpstreamConfig::default()).unwrap();
        // Port 9 (discard) on localhost is not expected to serve HTTP
        assert!(!client.probe("http://127.0.0.1:9/health", Duration::from_millis(500)).await);
        assert_eq!(client.stats().get_health_checks(), 1);
    }

    #[tokio::test]
    async fn test_send_transport_error() {
        let client = UpstreamClient::new(UpstreamConfig::default()).unwrap();
        let result = client
            .send(UpstreamRequest {
                method: hyper::Method::POST,
                url: "http://127.0.0.1:9/v1/audio/speech".to_string(),
                headers: Vec::new(),
                body: Bytes::from_static(b"{}"),
                timeout: Duration::from_millis(500),
            })
            .await;

        assert!(result.is_err());
        assert_eq!(client.stats().get_failed_requests(), 1);
    }
}
