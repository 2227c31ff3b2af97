//! Keep-alive supervision of active instances
//!
//! One task per active instance. Every interval it re-checks the instance,
//! retires it when it has aged out or stopped answering, and otherwise asks
//! the provisioner to keep the session alive. A task never restarts: a new
//! backend gets a new instance and a new task.

use crate::healthcheck::HealthChecker;
use crate::instance::InstanceState;
use crate::provisioner::SharedProvisioner;
use crate::registry::Registry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time allowed for tasks to wind down at shutdown
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Why a supervision task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Cancelled because the instance was superseded or at shutdown
    Cancelled,
    /// The instance left the registry or is no longer active
    NotActive,
    /// The instance exceeded its maximum age
    Expired,
    /// Health check failed; instance marked inactive
    Unhealthy,
    /// Keep-alive action failed; instance marked error
    KeepAliveFailed,
}

struct SupervisorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<ExitReason>,
}

/// Owns the keep-alive tasks, keyed by instance id
pub struct KeepAliveSupervisor {
    registry: Arc<Registry>,
    health: Arc<HealthChecker>,
    provisioner: SharedProvisioner,
    interval: Duration,
    tasks: DashMap<String, SupervisorHandle>,
}

impl KeepAliveSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<HealthChecker>,
        provisioner: SharedProvisioner,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            health,
            provisioner,
            interval,
            tasks: DashMap::new(),
        })
    }

    /// Start supervising an instance. No-op if a task already runs for it.
    pub fn start(self: &Arc<Self>, instance_id: &str) {
        self.tasks.entry(instance_id.to_string()).or_insert_with(|| {
            let (cancel, cancel_rx) = watch::channel(false);
            let supervisor = Arc::clone(self);
            let id = instance_id.to_string();
            let task = tokio::spawn(async move { supervisor.run(id, cancel_rx).await });
            info!(
                instance_id,
                interval_secs = self.interval.as_secs(),
                "Keep-alive supervision started"
            );
            SupervisorHandle { cancel, task }
        });
    }

    /// Ask the task for `instance_id` to stop. Returns whether one was running.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.tasks.get(instance_id) {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.tasks.contains_key(instance_id)
    }

    pub fn running_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task and wait for them to release their sessions.
    /// Returns why each task that stopped in time ended.
    pub async fn shutdown(&self) -> Vec<ExitReason> {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<SupervisorHandle> = ids
            .iter()
            .filter_map(|id| self.tasks.remove(id).map(|(_, handle)| handle))
            .collect();

        for handle in &handles {
            let _ = handle.cancel.send(true);
        }

        let count = handles.len();
        let mut reasons = Vec::with_capacity(count);
        let wait = async {
            for handle in handles {
                if let Ok(reason) = handle.task.await {
                    reasons.push(reason);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_WAIT, wait).await.is_err() {
            warn!("Timed out waiting for keep-alive tasks to stop");
        }
        debug!(count, stopped = reasons.len(), "Keep-alive supervision stopped");
        reasons
    }

    async fn run(self: Arc<Self>, instance_id: String, mut cancel_rx: watch::Receiver<bool>) -> ExitReason {
        let reason = self.supervise(&instance_id, &mut cancel_rx).await;

        info!(instance_id = %instance_id, ?reason, "Keep-alive supervision terminated");
        self.provisioner.release(&instance_id).await;
        self.tasks.remove(&instance_id);
        reason
    }

    async fn supervise(&self, instance_id: &str, cancel_rx: &mut watch::Receiver<bool>) -> ExitReason {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return ExitReason::Cancelled;
                    }
                    continue;
                }
            }

            let Some(instance) = self.registry.get(instance_id) else {
                return ExitReason::NotActive;
            };
            if instance.state != InstanceState::Active {
                return ExitReason::NotActive;
            }
            if instance.is_expired(self.registry.max_age()) {
                info!(instance_id, age_hours = instance.age_hours(), "Instance reached maximum age");
                self.registry.set_state(instance_id, InstanceState::Inactive);
                return ExitReason::Expired;
            }

            let Some(endpoint) = instance.endpoint.as_deref() else {
                return ExitReason::NotActive;
            };
            if !self.health.is_healthy(endpoint).await {
                warn!(instance_id, endpoint, "Instance no longer responding, marking inactive");
                self.registry.set_state(instance_id, InstanceState::Inactive);
                return ExitReason::Unhealthy;
            }

            debug!(instance_id, "Performing keep-alive action");
            if let Err(e) = self.provisioner.keep_alive(instance_id).await {
                error!(instance_id, error = %e, "Keep-alive action failed");
                self.registry.set_state(instance_id, InstanceState::Error);
                return ExitReason::KeepAliveFailed;
            }

            // Persist the refreshed record
            self.registry.update(instance_id, |_| true);
        }
    }
}
