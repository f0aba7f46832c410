//! LifecycleController — provisioning, termination, and reconciliation.
//!
//! ```text
//! provision:  add_instance (port reserved) ─► create ─► start ─► RuntimeStarted
//!                   failures retry with backoff, then RuntimeError ─► TERMINATED
//!
//! terminate:  DrainRequested ─► DrainCommand ─► wait for Deregister or grace
//!             ─► Drained ─► ShutdownCommand ─► stop + remove ─► RuntimeRemoved
//! ```
//!
//! The drain transition removes the instance from routing tables before any
//! runtime call is made, so proxies stop sending players first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fleetgrid_state::{
    InstanceId, InstanceState, Registry, RegistryError, TerminationReason, TransitionEvent,
    TransitionOutcome,
};
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{LifecycleError, LifecycleResult, RuntimeError, RuntimeResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec};

/// Outbound command channel to platform agents.
///
/// Implemented by the control server's connection table. Both methods
/// return `false` when no agent connection is bound to the instance.
pub trait AgentChannel: Send + Sync {
    fn send_drain(&self, instance_id: &str, grace: Duration) -> bool;
    fn send_shutdown(&self, instance_id: &str) -> bool;
}

/// Channel used until the control server is attached.
struct NoAgents;

impl AgentChannel for NoAgents {
    fn send_drain(&self, _instance_id: &str, _grace: Duration) -> bool {
        false
    }

    fn send_shutdown(&self, _instance_id: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Concurrent runtime calls.
    pub runtime_workers: usize,
    /// Deadline of a single runtime call.
    pub call_deadline: Duration,
    /// Create/start attempts before an instance is given up.
    pub provision_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Time a draining instance gets before it is stopped.
    pub drain_grace: Duration,
    /// Grace given to the container on stop before it is killed.
    pub stop_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            runtime_workers: 4,
            call_deadline: Duration::from_secs(30),
            provision_attempts: 3,
            backoff: BackoffPolicy::default(),
            drain_grace: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// What [`LifecycleController::reconcile`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Instances rebuilt from running containers.
    pub adopted: Vec<InstanceId>,
    /// Container ids removed as orphans.
    pub removed: Vec<String>,
}

struct Inner {
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    agents: RwLock<Arc<dyn AgentChannel>>,
    workers: Semaphore,
    settings: LifecycleSettings,
    /// Instances waiting in DRAINING for their agent's Deregister.
    drains: Mutex<HashMap<InstanceId, oneshot::Sender<()>>>,
}

/// Drives instances through the runtime. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(
        registry: Registry,
        runtime: Arc<dyn ContainerRuntime>,
        settings: LifecycleSettings,
    ) -> Self {
        let workers = Semaphore::new(settings.runtime_workers.max(1));
        Self {
            inner: Arc::new(Inner {
                registry,
                runtime,
                agents: RwLock::new(Arc::new(NoAgents)),
                workers,
                settings,
                drains: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach the agent command channel.
    pub fn set_agent_channel(&self, agents: Arc<dyn AgentChannel>) {
        *self.inner.agents.write().expect("agents lock") = agents;
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    fn agents(&self) -> Arc<dyn AgentChannel> {
        self.inner.agents.read().expect("agents lock").clone()
    }

    // ── Provisioning ──────────────────────────────────────────────

    /// Create `count` new instances of `group` and start their containers.
    ///
    /// Ports are reserved up front. If the range runs out before any
    /// instance is registered the call fails with `PortExhausted`; a partial
    /// reservation proceeds with what it got and raises a group alert.
    /// Returns the ids that reached STARTING.
    pub async fn provision(&self, group: &str, count: u32) -> LifecycleResult<Vec<InstanceId>> {
        let ids = self.reserve(group, count)?;
        info!(%group, requested = count, reserved = ids.len(), "provisioning instances");

        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let this = self.clone();
                tokio::spawn(async move { this.launch(id).await })
            })
            .collect();

        let mut started = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(id)) => started.push(id),
                Ok(Err(e)) => warn!(%group, error = %e, "instance provisioning failed"),
                Err(e) => error!(%group, error = %e, "provisioning task panicked"),
            }
        }
        Ok(started)
    }

    fn reserve(&self, group: &str, count: u32) -> LifecycleResult<Vec<InstanceId>> {
        let registry = &self.inner.registry;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match registry.add_instance(group) {
                Ok(id) => ids.push(id),
                Err(e @ RegistryError::PortExhausted { .. }) if ids.is_empty() => {
                    return Err(e.into());
                }
                Err(e @ RegistryError::PortExhausted { .. }) => {
                    registry.push_alert(group, None, e.to_string())?;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ids)
    }

    /// Create and start the container of a PROVISIONING instance.
    async fn launch(&self, id: InstanceId) -> LifecycleResult<InstanceId> {
        let registry = &self.inner.registry;
        let settings = &self.inner.settings;

        let (group, port) = registry
            .instance(&id)
            .map(|i| (i.group, i.port))
            .ok_or_else(|| RegistryError::InstanceNotFound(id.clone()))?;
        let group_spec = registry
            .group(&group)
            .map(|g| g.spec)
            .ok_or_else(|| RegistryError::GroupNotFound(group.clone()))?;
        let spec = ContainerSpec::for_instance(&group_spec, &id, port);

        let attempts = settings.provision_attempts.max(1);
        let mut last_error = String::new();
        let mut create_timed_out = false;
        for attempt in 0..attempts {
            match self.create_and_start(&id, &spec).await {
                Ok(container_id) => {
                    match registry.apply_transition(&id, TransitionEvent::RuntimeStarted) {
                        Ok(_) => {}
                        // The agent registered before the start call returned.
                        Err(RegistryError::InvalidTransition { from, .. })
                            if from != InstanceState::Provisioning =>
                        {
                            debug!(instance = %id, state = %from, "instance already past provisioning");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    info!(%group, instance = %id, %container_id, port, "instance started");
                    return Ok(id);
                }
                Err(e) => {
                    create_timed_out |=
                        matches!(e, LifecycleError::RuntimeTimeout { op: "create", .. });
                    last_error = e.to_string();
                    warn!(
                        %group,
                        instance = %id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "container launch failed"
                    );
                    registry.record_error(&id, last_error.clone())?;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(settings.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        // A create that outlived its deadline may have finished after all;
        // its container must be gone before the port is released.
        if create_timed_out {
            self.remove_instance_containers(&id).await;
        }
        registry.apply_transition_with_reason(
            &id,
            TransitionEvent::RuntimeError,
            TerminationReason::ProvisionFailed,
        )?;
        registry.push_alert(
            &group,
            Some(&id),
            format!("provisioning failed after {attempts} attempt(s): {last_error}"),
        )?;
        Err(LifecycleError::ProvisionFailed {
            instance: id,
            attempts,
            last_error,
        })
    }

    async fn create_and_start(&self, id: &str, spec: &ContainerSpec) -> LifecycleResult<String> {
        let runtime = &self.inner.runtime;
        let container_id = match self.call("create", runtime.create(spec)).await {
            Ok(container_id) => container_id,
            Err(e @ LifecycleError::RuntimeTimeout { .. }) => {
                self.remove_instance_containers(id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.inner.registry.attach_container(id, &container_id)?;

        if let Err(e) = self.call("start", runtime.start(&container_id)).await {
            if let Err(cleanup) = self.call("remove", runtime.remove(&container_id)).await {
                debug!(instance = %id, %container_id, error = %cleanup, "cleanup after failed start failed");
            }
            return Err(e);
        }
        Ok(container_id)
    }

    /// Remove every container labelled with instance `id`.
    async fn remove_instance_containers(&self, id: &str) {
        let runtime = &self.inner.runtime;
        let containers = match self.call("list", runtime.list_managed()).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(instance = %id, error = %e, "could not list containers for cleanup");
                return;
            }
        };
        for container in containers.iter().filter(|c| c.instance() == Some(id)) {
            info!(instance = %id, container = %container.id, "removing container of timed-out create");
            if let Err(e) = self.remove_orphan(&container.id).await {
                warn!(instance = %id, container = %container.id, error = %e, "container cleanup failed");
            }
        }
    }

    /// Run a runtime call on the worker pool under the call deadline.
    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RuntimeResult<T>>,
    ) -> LifecycleResult<T> {
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| RuntimeError::Backend("runtime worker pool closed".to_string()))?;
        let deadline = self.inner.settings.call_deadline;
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map_err(LifecycleError::from),
            Err(_) => Err(LifecycleError::RuntimeTimeout {
                op,
                after: deadline,
            }),
        }
    }

    // ── Termination ───────────────────────────────────────────────

    /// Gracefully take an instance out of service and remove it.
    ///
    /// ONLINE instances are drained first. UNRESPONSIVE instances skip the
    /// drain. Instances still starting up cannot be terminated.
    pub async fn terminate(&self, id: &str, reason: TerminationReason) -> LifecycleResult<()> {
        let registry = &self.inner.registry;
        let Some(instance) = registry.instance(id) else {
            if registry.is_tombstoned(id) {
                debug!(instance = %id, "terminate for already terminated instance");
                return Ok(());
            }
            return Err(RegistryError::InstanceNotFound(id.to_string()).into());
        };

        match instance.state {
            InstanceState::Online => {
                let outcome = registry.apply_transition_with_reason(
                    id,
                    TransitionEvent::DrainRequested,
                    reason,
                )?;
                if outcome == TransitionOutcome::Stale {
                    return Ok(());
                }
                if reason == TerminationReason::Deregistered {
                    debug!(instance = %id, "agent already left, skipping drain");
                } else {
                    self.wait_for_drain(id).await;
                }
                if registry.apply_transition(id, TransitionEvent::Drained)?
                    == TransitionOutcome::Stale
                {
                    return Ok(());
                }
                self.stop_and_remove(id).await
            }
            InstanceState::Unresponsive => {
                registry.apply_transition_with_reason(
                    id,
                    TransitionEvent::ReclaimTimeout,
                    reason,
                )?;
                self.stop_and_remove(id).await
            }
            InstanceState::Stopping => {
                registry.set_termination_reason(id, reason)?;
                self.stop_and_remove(id).await
            }
            InstanceState::Draining | InstanceState::Terminated => {
                debug!(instance = %id, state = %instance.state, "termination already in progress");
                Ok(())
            }
            state @ (InstanceState::Provisioning | InstanceState::Starting) => {
                Err(LifecycleError::NotTerminable {
                    instance: id.to_string(),
                    state,
                })
            }
        }
    }

    /// Remove the container of an instance the health monitor moved to STOPPING.
    pub async fn reclaim(&self, id: &str) -> LifecycleResult<()> {
        let registry = &self.inner.registry;
        match registry.instance(id) {
            Some(instance) if instance.state == InstanceState::Stopping => {
                info!(group = %instance.group, instance = %id, "reclaiming unresponsive instance");
                self.stop_and_remove(id).await
            }
            Some(instance) => {
                debug!(instance = %id, state = %instance.state, "reclaim skipped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn wait_for_drain(&self, id: &str) {
        let grace = self.inner.settings.drain_grace;
        let (tx, rx) = oneshot::channel();
        self.inner
            .drains
            .lock()
            .expect("drains lock")
            .insert(id.to_string(), tx);

        if self.agents().send_drain(id, grace) {
            match tokio::time::timeout(grace, rx).await {
                Ok(_) => debug!(instance = %id, "agent confirmed drain"),
                Err(_) => debug!(instance = %id, ?grace, "drain grace elapsed"),
            }
        } else {
            debug!(instance = %id, "no agent connected, skipping drain wait");
        }

        self.inner.drains.lock().expect("drains lock").remove(id);
    }

    /// STOPPING → TERMINATED: shut down and remove the container.
    async fn stop_and_remove(&self, id: &str) -> LifecycleResult<()> {
        let registry = &self.inner.registry;
        let settings = &self.inner.settings;
        let runtime = &self.inner.runtime;

        self.agents().send_shutdown(id);

        let Some(instance) = registry.instance(id) else {
            return Ok(());
        };

        if let Some(container_id) = instance.container_id.as_deref() {
            match self.call("stop", runtime.stop(container_id, settings.stop_timeout)).await {
                Ok(()) | Err(LifecycleError::Runtime(RuntimeError::NotFound(_))) => {}
                Err(e) => {
                    warn!(instance = %id, %container_id, error = %e, "container stop failed, removing anyway")
                }
            }

            let attempts = settings.provision_attempts.max(1);
            for attempt in 0..attempts {
                match self.call("remove", runtime.remove(container_id)).await {
                    Ok(()) | Err(LifecycleError::Runtime(RuntimeError::NotFound(_))) => break,
                    Err(e) if attempt + 1 < attempts => {
                        warn!(instance = %id, %container_id, error = %e, "container remove failed, retrying");
                        tokio::time::sleep(settings.backoff.delay(attempt)).await;
                    }
                    Err(e) => {
                        registry.record_error(id, e.to_string())?;
                        registry.push_alert(
                            &instance.group,
                            Some(id),
                            format!("container {container_id} could not be removed: {e}"),
                        )?;
                    }
                }
            }
        }

        registry.apply_transition(id, TransitionEvent::RuntimeRemoved)?;
        Ok(())
    }

    // ── Agent events ──────────────────────────────────────────────

    /// Release a pending drain wait. Returns false if none was pending.
    pub fn notify_drained(&self, id: &str) -> bool {
        match self.inner.drains.lock().expect("drains lock").remove(id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// React to an agent announcing its own shutdown.
    pub fn handle_deregister(&self, id: &str, reason: &str) {
        let Some(instance) = self.inner.registry.instance(id) else {
            debug!(instance = %id, "deregister for unknown instance");
            return;
        };
        info!(group = %instance.group, instance = %id, %reason, state = %instance.state, "agent deregistered");

        match instance.state {
            InstanceState::Draining => {
                self.notify_drained(id);
            }
            InstanceState::Online | InstanceState::Unresponsive => {
                let this = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = this.terminate(&id, TerminationReason::Deregistered).await {
                        warn!(instance = %id, error = %e, "termination after deregister failed");
                    }
                });
            }
            _ => debug!(instance = %id, "deregister ignored in current state"),
        }
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// Rebuild registry state from containers left by a previous run.
    ///
    /// Running containers of known groups are adopted into STARTING and must
    /// heartbeat before the startup timeout. Stopped ones are recorded as
    /// orphaned terminations. Containers of unknown groups are removed.
    pub async fn reconcile(&self) -> LifecycleResult<ReconcileReport> {
        let runtime = &self.inner.runtime;
        let containers = self.call("list", runtime.list_managed()).await?;
        let mut report = ReconcileReport::default();

        for container in containers {
            match self.reconcile_one(&container).await {
                Ok(Some(id)) => report.adopted.push(id),
                Ok(None) => report.removed.push(container.id.clone()),
                Err(e) => {
                    warn!(container = %container.id, error = %e, "reconciliation of container failed")
                }
            }
        }

        info!(
            runtime = runtime.name(),
            adopted = report.adopted.len(),
            removed = report.removed.len(),
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Returns the adopted instance id, or `None` if the container was removed.
    async fn reconcile_one(&self, container: &ContainerInfo) -> LifecycleResult<Option<InstanceId>> {
        let registry = &self.inner.registry;
        let known_group = container
            .group()
            .filter(|g| registry.group(g).is_some());

        let (Some(group), Some(port)) = (known_group, container.port()) else {
            info!(container = %container.id, group = ?container.group(), "removing orphaned container");
            self.remove_orphan(&container.id).await?;
            return Ok(None);
        };

        let id = match registry.adopt_instance(group, container.instance(), &container.id, port) {
            Ok(id) => id,
            Err(e) => {
                warn!(container = %container.id, %group, error = %e, "container cannot be adopted");
                self.remove_orphan(&container.id).await?;
                return Ok(None);
            }
        };

        if container.running {
            registry.apply_transition(&id, TransitionEvent::RuntimeStarted)?;
            Ok(Some(id))
        } else {
            self.remove_orphan(&container.id).await?;
            registry.apply_transition_with_reason(
                &id,
                TransitionEvent::RuntimeError,
                TerminationReason::Orphaned,
            )?;
            Ok(None)
        }
    }

    async fn remove_orphan(&self, container_id: &str) -> LifecycleResult<()> {
        let runtime = &self.inner.runtime;
        let stop_timeout = self.inner.settings.stop_timeout;
        match self.call("stop", runtime.stop(container_id, stop_timeout)).await {
            Ok(()) | Err(LifecycleError::Runtime(RuntimeError::NotFound(_))) => {}
            Err(e) => debug!(%container_id, error = %e, "orphan stop failed"),
        }
        match self.call("remove", runtime.remove(container_id)).await {
            Ok(()) | Err(LifecycleError::Runtime(RuntimeError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
