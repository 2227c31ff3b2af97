//! Provisioned backend instances and their lifecycle
//!
//! ```text
//! Initializing -> Active   (provisioning succeeded, endpoint known)
//! Initializing -> Error    (provisioning failed for this attempt)
//! Initializing -> Inactive (left over from a previous run at restore)
//! Active       -> Inactive (health check failed, or superseded)
//! Active       -> Error    (keep-alive raised an unrecoverable fault)
//! ```
//!
//! `Inactive` and `Error` are terminal. A fresh attempt always creates a
//! fresh instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Provisioning in progress, no endpoint yet
    Initializing,
    /// Endpoint known and serving
    Active,
    /// Stopped responding or was superseded
    Inactive,
    /// Provisioning or keep-alive failed
    Error,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Inactive | InstanceState::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        matches!(
            (self, next),
            (InstanceState::Initializing, InstanceState::Active)
                | (InstanceState::Initializing, InstanceState::Error)
                | (InstanceState::Initializing, InstanceState::Inactive)
                | (InstanceState::Active, InstanceState::Inactive)
                | (InstanceState::Active, InstanceState::Error)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Initializing => "initializing",
            InstanceState::Active => "active",
            InstanceState::Inactive => "inactive",
            InstanceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One provisioned backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Public tunnel address, set once when the instance becomes active
    pub endpoint: Option<String>,
    pub state: InstanceState,
    /// Name of the credential used to provision it, if any
    pub credential: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Instance {
    /// Start tracking a new provisioning attempt
    pub fn initializing(credential: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint: None,
            state: InstanceState::Initializing,
            credential,
            created_at: now,
            last_used_at: now,
        }
    }

    /// An already-active instance at a known endpoint
    pub fn active(endpoint: &str, credential: Option<String>) -> Self {
        let mut instance = Self::initializing(credential);
        instance.endpoint = Some(normalize_endpoint(endpoint));
        instance.state = InstanceState::Active;
        instance
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    pub fn age_hours(&self) -> f64 {
        self.age().as_secs_f64() / 3600.0
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Active, has an endpoint, and young enough to be reused
    pub fn is_eligible(&self, max_age: Duration) -> bool {
        self.state == InstanceState::Active && self.endpoint.is_some() && !self.is_expired(max_age)
    }

    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub fn transition(&mut self, next: InstanceState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Record the endpoint and become active. The endpoint is only ever set once.
    pub fn activate(&mut self, endpoint: &str) -> bool {
        if self.state != InstanceState::Initializing || self.endpoint.is_some() {
            return false;
        }
        self.endpoint = Some(normalize_endpoint(endpoint));
        self.state = InstanceState::Active;
        true
    }

    /// Full URL of `path` on this instance's endpoint
    pub fn url_for(&self, path: &str) -> Option<String> {
        self.endpoint.as_ref().map(|e| format!("{}{}", e, path))
    }
}

/// Trim whitespace and trailing slashes so paths can be appended directly
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}
