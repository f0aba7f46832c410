//! In-process container runtime.
//!
//! Keeps containers in a map and never runs anything. Used by tests and by
//! `runtime = "memory"` for trying the control plane without Docker.
//! Failures and latency can be injected per operation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetgrid_state::MANAGED_LABEL;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec};

#[derive(Debug, Clone)]
struct MemoryContainer {
    spec: ContainerSpec,
    running: bool,
}

#[derive(Debug, Default)]
struct Faults {
    create_failures: u32,
    start_failures: u32,
    remove_failures: u32,
    create_delay: Option<Duration>,
    create_reply_delay: Option<Duration>,
    start_delay: Option<Duration>,
}

/// Counters of calls made against a [`MemoryRuntime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub start: u32,
    pub stop: u32,
    pub remove: u32,
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    containers: Mutex<HashMap<String, MemoryContainer>>,
    faults: Mutex<Faults>,
    calls: Mutex<CallCounts>,
    next_id: AtomicU64,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` create calls.
    pub fn fail_creates(&self, n: u32) {
        self.faults.lock().expect("faults lock").create_failures = n;
    }

    /// Fail the next `n` start calls.
    pub fn fail_starts(&self, n: u32) {
        self.faults.lock().expect("faults lock").start_failures = n;
    }

    /// Fail the next `n` remove calls.
    pub fn fail_removes(&self, n: u32) {
        self.faults.lock().expect("faults lock").remove_failures = n;
    }

    /// Delay every create call, e.g. to trip the call deadline.
    pub fn delay_creates(&self, delay: Option<Duration>) {
        self.faults.lock().expect("faults lock").create_delay = delay;
    }

    /// Create containers at once but hold back the reply, like a daemon
    /// that finishes the work after the caller gave up.
    pub fn delay_create_replies(&self, delay: Option<Duration>) {
        self.faults.lock().expect("faults lock").create_reply_delay = delay;
    }

    pub fn delay_starts(&self, delay: Option<Duration>) {
        self.faults.lock().expect("faults lock").start_delay = delay;
    }

    /// Place a container directly, as if created by an earlier process.
    pub fn insert(&self, spec: ContainerSpec, running: bool) -> String {
        let id = self.allocate_id();
        self.containers
            .lock()
            .expect("containers lock")
            .insert(id.clone(), MemoryContainer { spec, running });
        id
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock().expect("calls lock")
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().expect("containers lock").len()
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .expect("containers lock")
            .values()
            .filter(|c| c.running)
            .count()
    }

    /// Spec of a container, if it exists.
    pub fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .expect("containers lock")
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    fn allocate_id(&self) -> String {
        format!("mem-{:06}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = self.faults.lock().expect("faults lock");
        let counter = pick(&mut *faults);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn info(id: &str, container: &MemoryContainer) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: container.spec.name.clone(),
            running: container.running,
            labels: container.spec.labels.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.calls.lock().expect("calls lock").create += 1;
        let (delay, reply_delay) = {
            let faults = self.faults.lock().expect("faults lock");
            (faults.create_delay, faults.create_reply_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_fault(|f| &mut f.create_failures) {
            return Err(RuntimeError::Backend(format!(
                "injected create failure for {}",
                spec.name
            )));
        }

        let id = {
            let mut containers = self.containers.lock().expect("containers lock");
            if containers.values().any(|c| c.spec.name == spec.name) {
                return Err(RuntimeError::Backend(format!(
                    "container name {} already in use",
                    spec.name
                )));
            }
            let id = self.allocate_id();
            containers.insert(
                id.clone(),
                MemoryContainer {
                    spec: spec.clone(),
                    running: false,
                },
            );
            id
        };
        if let Some(delay) = reply_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        self.calls.lock().expect("calls lock").start += 1;
        let delay = self.faults.lock().expect("faults lock").start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_fault(|f| &mut f.start_failures) {
            return Err(RuntimeError::Backend(format!(
                "injected start failure for {container_id}"
            )));
        }
        let mut containers = self.containers.lock().expect("containers lock");
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> RuntimeResult<()> {
        self.calls.lock().expect("calls lock").stop += 1;
        let mut containers = self.containers.lock().expect("containers lock");
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        self.calls.lock().expect("calls lock").remove += 1;
        if self.take_fault(|f| &mut f.remove_failures) {
            return Err(RuntimeError::Backend(format!(
                "injected remove failure for {container_id}"
            )));
        }
        self.containers
            .lock()
            .expect("containers lock")
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        let containers = self.containers.lock().expect("containers lock");
        Ok(containers
            .get(container_id)
            .map(|c| Self::info(container_id, c)))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let containers = self.containers.lock().expect("containers lock");
        let mut list: Vec<ContainerInfo> = containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(MANAGED_LABEL).is_some_and(|v| v == "true"))
            .map(|(id, c)| Self::info(id, c))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "lobby:latest".to_string(),
            env: BTreeMap::new(),
            command: None,
            memory_bytes: 0,
            cpu_millis: 0,
            host_port: 30000,
            labels: BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        }
    }

    #[tokio::test]
    async fn create_start_stop_remove() {
        let rt = MemoryRuntime::new();
        let id = rt.create(&spec("a")).await.unwrap();
        assert_eq!(rt.running_count(), 0);

        rt.start(&id).await.unwrap();
        assert!(rt.inspect(&id).await.unwrap().unwrap().running);

        rt.stop(&id, Duration::from_secs(1)).await.unwrap();
        rt.remove(&id).await.unwrap();
        assert!(rt.inspect(&id).await.unwrap().is_none());
        assert_eq!(
            rt.calls(),
            CallCounts {
                create: 1,
                start: 1,
                stop: 1,
                remove: 1
            }
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let rt = MemoryRuntime::new();
        rt.fail_creates(2);
        assert!(rt.create(&spec("a")).await.is_err());
        assert!(rt.create(&spec("a")).await.is_err());
        assert!(rt.create(&spec("a")).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let rt = MemoryRuntime::new();
        rt.create(&spec("a")).await.unwrap();
        assert!(rt.create(&spec("a")).await.is_err());
    }

    #[tokio::test]
    async fn list_managed_skips_unlabelled() {
        let rt = MemoryRuntime::new();
        let mut foreign = spec("foreign");
        foreign.labels.clear();
        rt.insert(foreign, true);
        rt.insert(spec("ours"), true);

        let listed = rt.list_managed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "ours");
    }

    #[tokio::test]
    async fn late_reply_still_creates_the_container() {
        let rt = MemoryRuntime::new();
        rt.delay_create_replies(Some(Duration::from_secs(5)));
        let attempt = tokio::time::timeout(Duration::from_millis(20), rt.create(&spec("a"))).await;
        assert!(attempt.is_err());
        assert_eq!(rt.container_count(), 1);
    }

    #[tokio::test]
    async fn missing_container_is_not_found() {
        let rt = MemoryRuntime::new();
        assert!(matches!(
            rt.remove("mem-404").await,
            Err(RuntimeError::NotFound(_))
        ));
    }
}
