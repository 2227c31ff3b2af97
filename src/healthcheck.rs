//! Health checks for backend endpoints
//!
//! A backend is healthy when its capability-listing path answers with a
//! success status within the probe timeout. There are no retries here;
//! callers decide what a failed probe means.

use crate::upstream::UpstreamClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Path probed on the backend
    pub path: String,
    /// Timeout for each probe
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/v1/audio/voices".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Probes backend endpoints
pub struct HealthChecker {
    upstream: Arc<UpstreamClient>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(upstream: Arc<UpstreamClient>, config: HealthCheckConfig) -> Self {
        Self { upstream, config }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Whether `endpoint` currently answers its capability listing
    pub async fn is_healthy(&self, endpoint: &str) -> bool {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), self.config.path);
        let healthy = self.upstream.probe(&url, self.config.timeout).await;
        debug!(endpoint, healthy, "Health check");
        healthy
    }
}
