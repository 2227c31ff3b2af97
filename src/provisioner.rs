//! The contract for obtaining new backends
//!
//! The orchestrator never knows how a backend comes to exist. A provisioner
//! is handed a credential (or none, meaning an operator has to step in) and
//! reports either a reachable endpoint or a classified failure.

use crate::credentials::Credential;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Phrase combinations that mark a provisioning failure as resource
/// exhaustion. A message matches when it contains every term of one entry.
const EXHAUSTION_MARKERS: &[&[&str]] = &[
    &["resource limit"],
    &["usage limit"],
    &["quota"],
    &["gpu", "unavailable"],
    &["gpu", "not available"],
    &["gpu", "exceeded"],
    &["gpu", "limited"],
];

/// Parameters of one provisioning attempt
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Id of the instance tracking this attempt
    pub instance_id: String,
    /// `None` when no credential is configured and login is manual
    pub credential: Option<Credential>,
    /// Backend resource class to ask for
    pub resource_preference: String,
    /// How long the attempt may take
    pub wait_budget: Duration,
}

impl ProvisionRequest {
    pub fn is_manual(&self) -> bool {
        self.credential.is_none()
    }

    pub fn credential_name(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.name.as_str())
    }
}

/// Result of one provisioning attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Backend is reachable at `endpoint`
    Success { endpoint: String },
    /// The requested resource class is unavailable for this credential
    ResourceExhausted { reason: String },
    /// Anything else: login failure, timeout, unexpected session state
    Failure { reason: String },
}

impl ProvisionOutcome {
    pub fn success(endpoint: impl Into<String>) -> Self {
        ProvisionOutcome::Success {
            endpoint: endpoint.into(),
        }
    }

    pub fn exhausted(reason: impl Into<String>) -> Self {
        ProvisionOutcome::ResourceExhausted {
            reason: reason.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        ProvisionOutcome::Failure {
            reason: reason.into(),
        }
    }

    /// Classify a failure message, treating quota and capacity messages as
    /// resource exhaustion
    pub fn from_failure_message(message: &str) -> Self {
        if is_exhaustion_message(message) {
            Self::exhausted(message)
        } else {
            Self::failure(message)
        }
    }
}

pub fn is_exhaustion_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    EXHAUSTION_MARKERS
        .iter()
        .any(|terms| terms.iter().all(|t| lower.contains(t)))
}

/// Something that can bring up a backend and keep its session alive
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Obtain a backend. Must return within roughly `request.wait_budget`.
    async fn provision(&self, request: ProvisionRequest) -> ProvisionOutcome;

    /// Provisioner-specific action that keeps the session of an active
    /// instance from idling out. An error retires the instance.
    async fn keep_alive(&self, _instance_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tear down whatever session backs the instance
    async fn release(&self, _instance_id: &str) {}

    /// Hand in an endpoint obtained out of band. Returns whether an
    /// attempt was waiting for it.
    fn submit_endpoint(&self, _endpoint: &str) -> bool {
        false
    }
}

pub type SharedProvisioner = Arc<dyn Provisioner>;

struct PendingAttempt {
    instance_id: String,
    tx: oneshot::Sender<String>,
}

/// Waits for an operator to submit the tunnel address
///
/// The operator brings up the backend by hand and posts its address to the
/// admin API, which forwards it through [`Provisioner::submit_endpoint`].
#[derive(Default)]
pub struct ManualProvisioner {
    pending: Mutex<Option<PendingAttempt>>,
}

impl ManualProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt is currently waiting for an endpoint
    pub fn is_waiting(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[async_trait]
impl Provisioner for ManualProvisioner {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn provision(&self, request: ProvisionRequest) -> ProvisionOutcome {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingAttempt {
            instance_id: request.instance_id.clone(),
            tx,
        });

        info!(
            instance_id = %request.instance_id,
            credential = ?request.credential_name(),
            resource = %request.resource_preference,
            wait_secs = request.wait_budget.as_secs(),
            "Waiting for an operator to submit the backend address (POST /provision/endpoint)"
        );

        let outcome = match tokio::time::timeout(request.wait_budget, rx).await {
            Ok(Ok(endpoint)) => ProvisionOutcome::success(endpoint),
            Ok(Err(_)) => ProvisionOutcome::failure("manual provisioning was abandoned"),
            Err(_) => ProvisionOutcome::failure(format!(
                "no endpoint submitted within {}s",
                request.wait_budget.as_secs()
            )),
        };

        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.instance_id == request.instance_id) {
            *pending = None;
        }
        outcome
    }

    fn submit_endpoint(&self, endpoint: &str) -> bool {
        let endpoint = endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            warn!(endpoint, "Rejected submitted endpoint without http(s) scheme");
            return false;
        }

        let Some(attempt) = self.pending.lock().take() else {
            warn!(endpoint, "Endpoint submitted but no provisioning attempt is waiting");
            return false;
        };

        info!(instance_id = %attempt.instance_id, endpoint, "Operator submitted backend address");
        attempt.tx.send(endpoint.to_string()).is_ok()
    }
}
