//! In-memory registry of every known instance
//!
//! Mutations are serialized behind one lock. Each mutation that changes
//! durable fields bumps a generation counter and hands a snapshot to the
//! [`StateStore`] off the request path.

use crate::healthcheck::HealthChecker;
use crate::instance::{Instance, InstanceState};
use crate::store::StateStore;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

struct Inner {
    /// Ordered by `created_at`
    instances: Vec<Instance>,
    generation: u64,
}

/// All known instances, indexed by id and ordered by creation time
pub struct Registry {
    inner: RwLock<Inner>,
    store: Option<Arc<StateStore>>,
    max_age: Duration,
}

impl Registry {
    pub fn new(store: Option<Arc<StateStore>>, max_age: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                instances: Vec::new(),
                generation: 0,
            }),
            store,
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Insert or replace an instance by id, then persist
    pub fn record(&self, instance: Instance) {
        let mut inner = self.inner.write();
        upsert(&mut inner.instances, instance);
        self.persist_locked(&mut inner);
    }

    /// Replace the whole registry (used when restoring history), then persist
    pub fn replace_all(&self, instances: Vec<Instance>) {
        let mut inner = self.inner.write();
        inner.instances.clear();
        for instance in instances {
            upsert(&mut inner.instances, instance);
        }
        self.persist_locked(&mut inner);
    }

    /// Replace the registry contents with the persisted history. Returns the
    /// number of instances loaded.
    pub fn load_history(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let instances = store.load();
        let count = instances.len();
        self.replace_all(instances);
        count
    }

    /// Apply `f` to the instance with `id` and persist if it reports a change.
    /// Returns the updated instance, or `None` if the id is unknown.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance) -> bool,
    {
        let mut inner = self.inner.write();
        let instance = inner.instances.iter_mut().find(|i| i.id == id)?;
        let changed = f(instance);
        let updated = instance.clone();
        if changed {
            self.persist_locked(&mut inner);
        }
        Some(updated)
    }

    /// Move an instance to `state` if the state machine allows it
    pub fn set_state(&self, id: &str, state: InstanceState) -> bool {
        let mut transitioned = false;
        self.update(id, |instance| {
            transitioned = instance.transition(state);
            transitioned
        });
        if transitioned {
            info!(instance_id = id, %state, "Instance state changed");
        }
        transitioned
    }

    /// Bump `last_used_at` on an instance that is still active
    pub fn touch(&self, id: &str) {
        self.update(id, |instance| {
            if instance.state == InstanceState::Active {
                instance.touch();
                true
            } else {
                false
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.inner.read().instances.iter().find(|i| i.id == id).cloned()
    }

    /// Snapshot of every instance in creation order
    pub fn all(&self) -> Vec<Instance> {
        self.inner.read().instances.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().instances.is_empty()
    }

    /// Active instances young enough to be reused, oldest first
    pub fn eligible(&self) -> Vec<Instance> {
        self.inner
            .read()
            .instances
            .iter()
            .filter(|i| i.is_eligible(self.max_age))
            .cloned()
            .collect()
    }

    /// First eligible instance whose live health check passes. Its
    /// `last_used_at` is bumped; failed probes leave state untouched.
    pub async fn find_healthy(&self, checker: &HealthChecker) -> Option<Instance> {
        for candidate in self.eligible() {
            let Some(endpoint) = candidate.endpoint.as_deref() else {
                continue;
            };
            if !checker.is_healthy(endpoint).await {
                debug!(instance_id = %candidate.id, endpoint, "Instance failed health check");
                continue;
            }

            // State may have moved on while probing
            let touched = self.update(&candidate.id, |instance| {
                if instance.is_eligible(self.max_age) {
                    instance.touch();
                    true
                } else {
                    false
                }
            });
            if let Some(instance) = touched.filter(|i| i.is_eligible(self.max_age)) {
                return Some(instance);
            }
        }
        None
    }

    /// Force an immediate synchronous write of the current state
    pub fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut inner = self.inner.write();
        inner.generation += 1;
        if let Err(e) = store.save_snapshot(inner.generation, &inner.instances) {
            error!(error = %e, "Failed to flush instance history");
        }
    }

    fn persist_locked(&self, inner: &mut Inner) {
        let Some(store) = &self.store else {
            return;
        };
        inner.generation += 1;
        let generation = inner.generation;
        let snapshot = inner.instances.clone();
        let store = Arc::clone(store);

        let write = move || {
            if let Err(e) = store.save_snapshot(generation, &snapshot) {
                error!(generation, error = %e, "Failed to persist instance history");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

fn upsert(instances: &mut Vec<Instance>, instance: Instance) {
    if let Some(existing) = instances.iter_mut().find(|i| i.id == instance.id) {
        *existing = instance;
        return;
    }
    let position = instances.partition_point(|i| i.created_at <= instance.created_at);
    instances.insert(position, instance);
}
