//! Provisioning coordination
//!
//! The [`Orchestrator`] owns the process-wide state: credential rotation, the
//! instance registry, the single-flight provisioning gate and the keep-alive
//! supervisor. Everything else reaches that state through it.
//!
//! # Single flight
//!
//! At most one provisioning attempt runs at a time. The attempt runs in its
//! own task; callers subscribe to its result. A caller that goes away does not
//! cancel the attempt, and callers arriving mid-flight share its result
//! instead of starting a second one.
//!
//! # Failover
//!
//! When a credential reports resource exhaustion, the next credential in
//! rotation is tried, each at most once per top-level request. Failover is a
//! plain loop over a visited set, so it always terminates.

use crate::config::OrchestratorConfig;
use crate::credentials::{Credential, CredentialRotator};
use crate::error::ProvisionError;
use crate::healthcheck::HealthChecker;
use crate::instance::{normalize_endpoint, Instance, InstanceState};
use crate::provisioner::{ProvisionOutcome, ProvisionRequest, SharedProvisioner};
use crate::registry::Registry;
use crate::supervisor::{ExitReason, KeepAliveSupervisor};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Slack on top of the wait budget before the orchestrator gives up on a
/// provisioner that does not return
const PROVISION_GRACE: Duration = Duration::from_secs(30);

type FlightResult = Result<Instance, ProvisionError>;
type FlightReceiver = watch::Receiver<Option<FlightResult>>;

/// Tunables of the orchestrator, derived from `[orchestrator]`
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Resource class asked of the provisioner
    pub resource_preference: String,
    /// Wait budget for one provisioner call with a credential
    pub provision_timeout: Duration,
    /// Extra budget when no credential is available and login is manual
    pub manual_wait: Duration,
    /// Also fail over on failures not classified as resource exhaustion
    pub failover_on_failure: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            resource_preference: config.resource_preference.clone(),
            provision_timeout: config.provision_timeout(),
            manual_wait: config.manual_wait(),
            failover_on_failure: config.failover_on_failure,
        }
    }

    /// Wait budget for the manual path
    pub fn manual_budget(&self) -> Duration {
        self.provision_timeout + self.manual_wait
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Clears the in-flight slot when the provisioning task ends, even by panic
struct FlightGate<'a> {
    slot: &'a Mutex<Option<FlightReceiver>>,
}

impl Drop for FlightGate<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Most recent activation: a counter bumped on every activation and the id
/// of the instance it activated
#[derive(Debug, Default)]
struct Activation {
    count: u64,
    instance_id: Option<String>,
}

/// Summary of a restore pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Instances read from the store
    pub loaded: usize,
    /// Active instances that passed their health check and are supervised again
    pub resumed: usize,
    /// Instances demoted to inactive
    pub demoted: usize,
}

/// Coordinates provisioning, reuse and retirement of backend instances
pub struct Orchestrator {
    settings: OrchestratorSettings,
    rotator: CredentialRotator,
    registry: Arc<Registry>,
    health: Arc<HealthChecker>,
    provisioner: SharedProvisioner,
    supervisor: Arc<KeepAliveSupervisor>,
    in_flight: Mutex<Option<FlightReceiver>>,
    activation: Mutex<Activation>,
}

impl Orchestrator {
    /// Create the orchestrator.
    ///
    /// Returns `Arc<Self>` because provisioning runs in spawned tasks that
    /// hold on to it.
    pub fn new(
        settings: OrchestratorSettings,
        credentials: Vec<Credential>,
        registry: Arc<Registry>,
        health: Arc<HealthChecker>,
        provisioner: SharedProvisioner,
        supervisor: Arc<KeepAliveSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            rotator: CredentialRotator::new(credentials),
            registry,
            health,
            provisioner,
            supervisor,
            in_flight: Mutex::new(None),
            activation: Mutex::new(Activation::default()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn provisioner(&self) -> &SharedProvisioner {
        &self.provisioner
    }

    pub fn supervisor(&self) -> &Arc<KeepAliveSupervisor> {
        &self.supervisor
    }

    pub fn has_credential(&self, name: &str) -> bool {
        self.rotator.credentials().iter().any(|c| c.name == name)
    }

    /// Name of the credential most recently handed to the provisioner
    pub fn last_credential(&self) -> Option<String> {
        self.rotator.last_selected()
    }

    /// Whether a provisioning attempt is currently in flight
    pub fn is_provisioning(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// A healthy instance to forward to: reuse one if possible, otherwise
    /// provision a new one and wait for it
    pub async fn acquire(self: &Arc<Self>) -> FlightResult {
        // An attempt may finish while the health checks below are running
        let seen = self.activation.lock().count;
        if let Some(instance) = self.registry.find_healthy(&self.health).await {
            debug!(instance_id = %instance.id, "Reusing healthy instance");
            return Ok(instance);
        }
        info!("No healthy instance available, provisioning");
        let rx = self.join_or_start(None, Some(seen));
        Self::wait_for(rx).await
    }

    /// Provision a new instance, or join the attempt already in flight.
    ///
    /// `preferred` names a credential to start with; unknown names fall back
    /// to normal rotation. A caller joining an attempt in flight shares its
    /// result regardless of `preferred`.
    pub async fn obtain_instance(self: &Arc<Self>, preferred: Option<&str>) -> FlightResult {
        let rx = self.join_or_start(preferred, None);
        Self::wait_for(rx).await
    }

    async fn wait_for(mut rx: FlightReceiver) -> FlightResult {
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                let current = rx.borrow().clone();
                return current.unwrap_or_else(|| {
                    Err(ProvisionError::Failure {
                        credential: None,
                        reason: "provisioning task ended without a result".to_string(),
                    })
                });
            }
        }
    }

    /// Start provisioning in the background without waiting for it
    pub fn launch(self: &Arc<Self>, preferred: Option<&str>) {
        let this = Arc::clone(self);
        let preferred = preferred.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = this.obtain_instance(preferred.as_deref()).await {
                warn!(error = %e, "Background provisioning failed");
            }
        });
    }

    /// Join the attempt in flight or start one. With `seen` set, an instance
    /// activated after that activation count is handed back instead of
    /// starting a new attempt.
    fn join_or_start(self: &Arc<Self>, preferred: Option<&str>, seen: Option<u64>) -> FlightReceiver {
        let mut slot = self.in_flight.lock();
        if let Some(rx) = slot.as_ref() {
            debug!("Joining provisioning attempt already in flight");
            return rx.clone();
        }

        if let Some(instance) = seen.and_then(|seen| self.activated_since(seen)) {
            debug!(instance_id = %instance.id, "Instance became active during health checks, reusing it");
            let (_, rx) = watch::channel(Some(Ok(instance)));
            return rx;
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let this = Arc::clone(self);
        let preferred = preferred.map(str::to_string);
        tokio::spawn(async move {
            let gate = FlightGate { slot: &this.in_flight };
            let result = this.provision_with_failover(preferred.as_deref()).await;
            drop(gate);
            tx.send_replace(Some(result));
        });
        rx
    }

    /// The latest activated instance if activations happened after `seen`
    /// and it is still eligible
    fn activated_since(&self, seen: u64) -> Option<Instance> {
        let activation = self.activation.lock();
        if activation.count == seen {
            return None;
        }
        let id = activation.instance_id.as_deref()?;
        self.registry
            .get(id)
            .filter(|i| i.is_eligible(self.registry.max_age()))
    }

    async fn provision_with_failover(&self, preferred: Option<&str>) -> FlightResult {
        if self.rotator.is_empty() {
            info!(
                wait_secs = self.settings.manual_budget().as_secs(),
                "No credentials configured, provisioning requires manual login"
            );
            return self.attempt(None, self.settings.manual_budget()).await;
        }

        let mut tried: HashSet<String> = HashSet::new();
        let mut next = match preferred {
            Some(name) => self.rotator.select_named(name).or_else(|| {
                warn!(credential = name, "Requested credential not configured, using rotation");
                self.rotator.select_next_excluding(&tried)
            }),
            None => self.rotator.select_next_excluding(&tried),
        };
        let mut last_error = None;

        while let Some(credential) = next {
            tried.insert(credential.name.clone());
            let name = credential.name.clone();

            let error = match self.attempt(Some(credential), self.settings.provision_timeout).await {
                Ok(instance) => return Ok(instance),
                Err(e) => e,
            };

            let failover = error.is_retryable() || self.settings.failover_on_failure;
            if !failover || tried.len() >= self.rotator.len() {
                if tried.len() > 1 {
                    error!(attempts = tried.len(), error = %error, "All credentials tried, giving up");
                }
                return Err(error);
            }

            warn!(credential = %name, error = %error, "Failing over to next credential");
            last_error = Some(error);
            next = self.rotator.select_next_excluding(&tried);
        }

        Err(last_error.unwrap_or_else(|| ProvisionError::Failure {
            credential: None,
            reason: "no credential available".to_string(),
        }))
    }

    /// One provisioning attempt tracked by a fresh instance
    async fn attempt(&self, credential: Option<Credential>, wait_budget: Duration) -> FlightResult {
        let credential_name = credential.as_ref().map(|c| c.name.clone());
        let instance = Instance::initializing(credential_name.clone());
        let instance_id = instance.id.clone();
        self.registry.record(instance);

        info!(
            instance_id = %instance_id,
            credential = ?credential_name,
            provisioner = self.provisioner.name(),
            wait_secs = wait_budget.as_secs(),
            "Provisioning new instance"
        );

        let request = ProvisionRequest {
            instance_id: instance_id.clone(),
            credential,
            resource_preference: self.settings.resource_preference.clone(),
            wait_budget,
        };
        let outcome =
            match tokio::time::timeout(wait_budget + PROVISION_GRACE, self.provisioner.provision(request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.provisioner.release(&instance_id).await;
                    ProvisionOutcome::failure(format!(
                        "provisioner did not answer within {}s",
                        (wait_budget + PROVISION_GRACE).as_secs()
                    ))
                }
            };

        match outcome {
            ProvisionOutcome::Success { endpoint } => {
                let endpoint = normalize_endpoint(&endpoint);
                if endpoint.is_empty() {
                    self.registry.set_state(&instance_id, InstanceState::Error);
                    self.provisioner.release(&instance_id).await;
                    return Err(ProvisionError::Failure {
                        credential: credential_name,
                        reason: "provisioner reported an empty endpoint".to_string(),
                    });
                }

                let instance = self
                    .registry
                    .update(&instance_id, |i| i.activate(&endpoint))
                    .filter(|i| i.state == InstanceState::Active);
                let Some(instance) = instance else {
                    self.provisioner.release(&instance_id).await;
                    return Err(ProvisionError::Failure {
                        credential: credential_name,
                        reason: "instance left the registry while provisioning".to_string(),
                    });
                };

                info!(
                    instance_id = %instance_id,
                    credential = ?credential_name,
                    endpoint = %endpoint,
                    "Instance active"
                );
                self.supersede(&instance_id);
                self.supervisor.start(&instance_id);
                {
                    let mut activation = self.activation.lock();
                    activation.count += 1;
                    activation.instance_id = Some(instance_id.clone());
                }
                Ok(instance)
            }
            ProvisionOutcome::ResourceExhausted { reason } => {
                warn!(instance_id = %instance_id, credential = ?credential_name, reason = %reason, "Resource exhausted");
                self.registry.set_state(&instance_id, InstanceState::Error);
                Err(ProvisionError::ResourceExhausted {
                    credential: credential_name,
                    reason,
                })
            }
            ProvisionOutcome::Failure { reason } => {
                error!(instance_id = %instance_id, credential = ?credential_name, reason = %reason, "Provisioning failed");
                self.registry.set_state(&instance_id, InstanceState::Error);
                Err(ProvisionError::Failure {
                    credential: credential_name,
                    reason,
                })
            }
        }
    }

    /// Retire every other active instance so only `current` is served
    fn supersede(&self, current: &str) {
        for instance in self.registry.all() {
            if instance.id == current || instance.state != InstanceState::Active {
                continue;
            }
            info!(instance_id = %instance.id, superseded_by = current, "Superseding instance");
            self.registry.set_state(&instance.id, InstanceState::Inactive);
            self.supervisor.cancel(&instance.id);
        }
    }

    /// Reload the persisted history and resume supervision of instances that
    /// are still alive. Everything else left non-terminal is marked inactive.
    pub async fn restore(self: &Arc<Self>) -> RestoreSummary {
        let mut summary = RestoreSummary {
            loaded: self.registry.load_history(),
            ..Default::default()
        };

        let mut alive = Vec::new();
        for instance in self.registry.all() {
            match instance.state {
                InstanceState::Active => {
                    let healthy = instance.is_eligible(self.registry.max_age())
                        && match instance.endpoint.as_deref() {
                            Some(endpoint) => self.health.is_healthy(endpoint).await,
                            None => false,
                        };
                    if healthy {
                        alive.push(instance);
                    } else if self.registry.set_state(&instance.id, InstanceState::Inactive) {
                        summary.demoted += 1;
                    }
                }
                InstanceState::Initializing => {
                    if self.registry.set_state(&instance.id, InstanceState::Inactive) {
                        summary.demoted += 1;
                    }
                }
                InstanceState::Inactive | InstanceState::Error => {}
            }
        }

        // Only the newest live instance stays current
        alive.sort_by_key(|i| i.created_at);
        if let Some(current) = alive.pop() {
            for older in alive {
                info!(instance_id = %older.id, superseded_by = %current.id, "Superseding restored instance");
                if self.registry.set_state(&older.id, InstanceState::Inactive) {
                    summary.demoted += 1;
                }
            }
            info!(instance_id = %current.id, endpoint = ?current.endpoint, "Resuming restored instance");
            self.supervisor.start(&current.id);
            summary.resumed += 1;
        }

        info!(
            loaded = summary.loaded,
            resumed = summary.resumed,
            demoted = summary.demoted,
            "Instance history restored"
        );
        summary
    }

    /// Record that forwarding to an instance failed at the transport level.
    /// The instance is retired; the request is not retried elsewhere.
    pub fn mark_unreachable(&self, instance: &Instance, reason: &str) -> ProvisionError {
        let endpoint = instance.endpoint.clone().unwrap_or_default();
        warn!(instance_id = %instance.id, endpoint = %endpoint, reason, "Backend unreachable, marking inactive");
        self.registry.set_state(&instance.id, InstanceState::Inactive);
        self.supervisor.cancel(&instance.id);
        ProvisionError::BackendUnreachable {
            endpoint,
            reason: reason.to_string(),
        }
    }

    /// Bump `last_used_at` after a successful forward
    pub fn touch(&self, instance_id: &str) {
        self.registry.touch(instance_id);
    }

    /// Stop supervision (releasing sessions) and flush state to disk
    pub async fn shutdown(&self) {
        let reasons = self.supervisor.shutdown().await;
        let cancelled = reasons.iter().filter(|r| **r == ExitReason::Cancelled).count();
        self.registry.flush();
        info!(supervised = reasons.len(), cancelled, "Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::HealthCheckConfig;
    use crate::provisioner::Provisioner;
    use crate::upstream::{UpstreamClient, UpstreamConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays queued outcomes and records every request it receives
    #[derive(Default)]
    struct ScriptedProvisioner {
        outcomes: Mutex<VecDeque<ProvisionOutcome>>,
        requests: Mutex<Vec<ProvisionRequest>>,
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ScriptedProvisioner {
        fn new(outcomes: Vec<ProvisionOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn with_delay(outcomes: Vec<ProvisionOutcome>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                delay,
                ..Default::default()
            })
        }

        fn credentials_used(&self) -> Vec<Option<String>> {
            self.requests
                .lock()
                .iter()
                .map(|r| r.credential_name().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl Provisioner for ScriptedProvisioner {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn provision(&self, request: ProvisionRequest) -> ProvisionOutcome {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.requests.lock().push(request);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| ProvisionOutcome::failure("script exhausted"))
        }
    }

    fn orchestrator(
        names: &[&str],
        provisioner: Arc<ScriptedProvisioner>,
        settings: OrchestratorSettings,
    ) -> Arc<Orchestrator> {
        let registry = Arc::new(Registry::new(None, Duration::from_secs(3600)));
        let health = Arc::new(HealthChecker::new(
            Arc::new(UpstreamClient::new(UpstreamConfig::default()).unwrap()),
            HealthCheckConfig {
                path: "/v1/audio/voices".to_string(),
                timeout: Duration::from_millis(200),
            },
        ));
        let supervisor = KeepAliveSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            provisioner.clone(),
            Duration::from_secs(3600),
        );
        Orchestrator::new(
            settings,
            names.iter().map(|n| Credential::new(n, "secret")).collect(),
            registry,
            health,
            provisioner,
            supervisor,
        )
    }

    fn states(orchestrator: &Orchestrator) -> Vec<(Option<String>, InstanceState)> {
        orchestrator
            .registry()
            .all()
            .into_iter()
            .map(|i| (i.credential, i.state))
            .collect()
    }

    #[tokio::test]
    async fn test_success_records_active_instance() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::success("http://backend-1/")]);
        let orch = orchestrator(&["A"], provisioner.clone(), OrchestratorSettings::default());

        let instance = orch.obtain_instance(None).await.unwrap();
        assert_eq!(instance.state, InstanceState::Active);
        assert_eq!(instance.endpoint.as_deref(), Some("http://backend-1"));
        assert_eq!(instance.credential.as_deref(), Some("A"));
        assert!(orch.supervisor().is_running(&instance.id));
        assert!(!orch.is_provisioning());
    }

    #[tokio::test]
    async fn test_failover_walks_credentials_once() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::exhausted("A out of T4"),
            ProvisionOutcome::exhausted("B out of T4"),
            ProvisionOutcome::exhausted("C out of T4"),
            ProvisionOutcome::success("http://never"),
        ]);
        let orch = orchestrator(&["A", "B", "C"], provisioner.clone(), OrchestratorSettings::default());

        let err = orch.obtain_instance(None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceExhausted { ref credential, .. } if credential.as_deref() == Some("C")));
        assert_eq!(
            provisioner.credentials_used(),
            vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string())]
        );
        assert!(states(&orch).iter().all(|(_, s)| *s == InstanceState::Error));
    }

    #[tokio::test]
    async fn test_exhausted_then_success() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::exhausted("no T4 left"),
            ProvisionOutcome::success("http://backend-2"),
        ]);
        let orch = orchestrator(&["A", "B"], provisioner, OrchestratorSettings::default());

        let instance = orch.obtain_instance(None).await.unwrap();
        assert_eq!(instance.endpoint.as_deref(), Some("http://backend-2"));
        assert_eq!(
            states(&orch),
            vec![
                (Some("A".to_string()), InstanceState::Error),
                (Some("B".to_string()), InstanceState::Active),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_is_terminal_without_failover_flag() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::failure("login rejected"),
            ProvisionOutcome::success("http://never"),
        ]);
        let orch = orchestrator(&["A", "B"], provisioner.clone(), OrchestratorSettings::default());

        let err = orch.obtain_instance(None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Failure { .. }));
        assert_eq!(provisioner.credentials_used().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_fails_over_when_enabled() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::failure("login rejected"),
            ProvisionOutcome::success("http://backend-b"),
        ]);
        let settings = OrchestratorSettings {
            failover_on_failure: true,
            ..Default::default()
        };
        let orch = orchestrator(&["A", "B"], provisioner, settings);

        let instance = orch.obtain_instance(None).await.unwrap();
        assert_eq!(instance.credential.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_single_credential_does_not_fail_over() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::exhausted("quota exceeded")]);
        let orch = orchestrator(&["A"], provisioner.clone(), OrchestratorSettings::default());

        assert!(orch.obtain_instance(None).await.is_err());
        assert_eq!(provisioner.credentials_used().len(), 1);
    }

    #[tokio::test]
    async fn test_preferred_credential_starts_rotation() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::exhausted("quota"),
            ProvisionOutcome::success("http://backend"),
        ]);
        let orch = orchestrator(&["A", "B", "C"], provisioner.clone(), OrchestratorSettings::default());

        orch.obtain_instance(Some("B")).await.unwrap();
        assert_eq!(
            provisioner.credentials_used(),
            vec![Some("B".to_string()), Some("C".to_string())]
        );
    }

    #[tokio::test]
    async fn test_no_credentials_uses_manual_budget() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::success("http://manual")]);
        let settings = OrchestratorSettings {
            provision_timeout: Duration::from_secs(10),
            manual_wait: Duration::from_secs(5),
            ..Default::default()
        };
        let orch = orchestrator(&[], provisioner.clone(), settings);

        let instance = orch.obtain_instance(None).await.unwrap();
        assert_eq!(instance.credential, None);

        let requests = provisioner.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].is_manual());
        assert_eq!(requests[0].wait_budget, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let provisioner = ScriptedProvisioner::with_delay(
            vec![ProvisionOutcome::success("http://backend")],
            Duration::from_millis(100),
        );
        let orch = orchestrator(&["A", "B"], provisioner.clone(), OrchestratorSettings::default());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move { orch.obtain_instance(None).await }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(provisioner.requests.lock().len(), 1);
        assert_eq!(provisioner.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_attempt() {
        let provisioner = ScriptedProvisioner::with_delay(
            vec![ProvisionOutcome::success("http://backend")],
            Duration::from_millis(100),
        );
        let orch = orchestrator(&["A"], provisioner, OrchestratorSettings::default());

        let caller = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.obtain_instance(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        for _ in 0..50 {
            if !orch.is_provisioning() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(states(&orch), vec![(Some("A".to_string()), InstanceState::Active)]);
    }

    #[tokio::test]
    async fn test_activation_during_health_check_is_reused() {
        // Accepts connections but never answers, so its health check runs to the timeout
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let provisioner = ScriptedProvisioner::with_delay(
            vec![
                ProvisionOutcome::success("http://fresh-backend"),
                ProvisionOutcome::success("http://second-backend"),
            ],
            Duration::from_millis(50),
        );
        let orch = orchestrator(&["A", "B"], provisioner.clone(), OrchestratorSettings::default());
        let stale = Instance::active(&format!("http://{}", silent_addr), Some("old".to_string()));
        orch.registry().record(stale.clone());

        let background = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.obtain_instance(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let acquired = orch.acquire().await.unwrap();
        let fresh = background.await.unwrap().unwrap();

        assert_eq!(acquired.id, fresh.id);
        assert_eq!(provisioner.requests.lock().len(), 1);
        assert_eq!(orch.registry().get(&fresh.id).unwrap().state, InstanceState::Active);
        assert_eq!(orch.registry().get(&stale.id).unwrap().state, InstanceState::Inactive);
        drop(silent);
    }

    #[tokio::test]
    async fn test_acquire_provisions_when_nothing_was_activated() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::success("http://backend")]);
        let orch = orchestrator(&["A"], provisioner.clone(), OrchestratorSettings::default());

        let instance = orch.acquire().await.unwrap();
        assert_eq!(instance.endpoint.as_deref(), Some("http://backend"));
        assert_eq!(provisioner.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_new_instance_supersedes_previous() {
        let provisioner = ScriptedProvisioner::new(vec![
            ProvisionOutcome::success("http://backend-1"),
            ProvisionOutcome::success("http://backend-2"),
        ]);
        let orch = orchestrator(&["A"], provisioner, OrchestratorSettings::default());

        let first = orch.obtain_instance(None).await.unwrap();
        let second = orch.obtain_instance(None).await.unwrap();

        assert_eq!(orch.registry().get(&first.id).unwrap().state, InstanceState::Inactive);
        assert_eq!(orch.registry().get(&second.id).unwrap().state, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_empty_endpoint_is_failure() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::success("  ")]);
        let orch = orchestrator(&["A"], provisioner, OrchestratorSettings::default());

        assert!(matches!(
            orch.obtain_instance(None).await,
            Err(ProvisionError::Failure { .. })
        ));
        assert_eq!(states(&orch), vec![(Some("A".to_string()), InstanceState::Error)]);
    }

    #[tokio::test]
    async fn test_mark_unreachable_retires_instance() {
        let provisioner = ScriptedProvisioner::new(vec![ProvisionOutcome::success("http://backend")]);
        let orch = orchestrator(&["A"], provisioner, OrchestratorSettings::default());
        let instance = orch.obtain_instance(None).await.unwrap();

        let err = orch.mark_unreachable(&instance, "connection reset");
        assert!(matches!(err, ProvisionError::BackendUnreachable { .. }));
        assert_eq!(orch.registry().get(&instance.id).unwrap().state, InstanceState::Inactive);
    }
}
