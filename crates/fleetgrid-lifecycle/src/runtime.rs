//! Container runtime abstraction.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetgrid_state::{
    GROUP_LABEL, GroupSpec, INSTANCE_LABEL, InstanceId, MANAGED_LABEL, PORT_LABEL,
};

use crate::error::RuntimeResult;

/// Everything a runtime needs to create one instance's container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
    pub memory_bytes: u64,
    pub cpu_millis: u32,
    /// Host port, also exposed inside the container as `SERVER_PORT`.
    pub host_port: u16,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Build the container spec of `instance` from its group template.
    pub fn for_instance(group: &GroupSpec, instance: &InstanceId, port: u16) -> Self {
        let template = &group.template;

        let mut env = template.env.clone();
        env.insert("SERVER_PORT".to_string(), port.to_string());
        env.insert("FLEETGRID_GROUP".to_string(), group.name.clone());
        env.insert("FLEETGRID_INSTANCE_ID".to_string(), instance.clone());

        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (GROUP_LABEL.to_string(), group.name.clone()),
            (INSTANCE_LABEL.to_string(), instance.clone()),
            (PORT_LABEL.to_string(), port.to_string()),
        ]);

        Self {
            name: format!("fleetgrid-{instance}"),
            image: template.image.clone(),
            env,
            command: template.command.clone(),
            memory_bytes: template.memory_bytes,
            cpu_millis: template.cpu_millis,
            host_port: port,
            labels,
        }
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn group(&self) -> Option<&str> {
        self.labels.get(GROUP_LABEL).map(String::as_str)
    }

    pub fn instance(&self) -> Option<&str> {
        self.labels.get(INSTANCE_LABEL).map(String::as_str)
    }

    pub fn port(&self) -> Option<u16> {
        self.labels.get(PORT_LABEL)?.parse().ok()
    }
}

/// Create, start, stop, and remove containers.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a container and return its runtime id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, container_id: &str) -> RuntimeResult<()>;

    /// Ask the container to stop, killing it after `grace`.
    async fn stop(&self, container_id: &str, grace: Duration) -> RuntimeResult<()>;

    async fn remove(&self, container_id: &str) -> RuntimeResult<()>;

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>>;

    /// All containers carrying the managed label, running or not.
    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>>;
}
