//! Docker runtime backed by bollard.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use fleetgrid_state::MANAGED_LABEL;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec};

/// Runs instances as containers on the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect using the local defaults (unix socket or `DOCKER_HOST`).
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Backend(format!("failed to connect to docker: {e}")))?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }
}

fn map_err(container_id: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container_id.to_string()),
        other => RuntimeError::Backend(other.to_string()),
    }
}

fn to_btree(labels: Option<HashMap<String, String>>) -> BTreeMap<String, String> {
    labels.unwrap_or_default().into_iter().collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let port_key = format!("{}/tcp", spec.host_port);
        let bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let host_config = HostConfig {
            memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes as i64),
            nano_cpus: (spec.cpu_millis > 0).then_some(spec.cpu_millis as i64 * 1_000_000),
            port_bindings: Some(bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(&spec.name, e))?;
        debug!(name = %spec.name, id = %created.id, "docker container created");
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| map_err(container_id, e))
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| map_err(container_id, e))
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_err(container_id, e))
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(Some(ContainerInfo {
                id: details.id.unwrap_or_else(|| container_id.to_string()),
                name: details
                    .name
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                running: details.state.and_then(|s| s.running).unwrap_or(false),
                labels: to_btree(details.config.and_then(|c| c.labels)),
            })),
            Err(e) => match map_err(container_id, e) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Backend(e.to_string()))?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let id = s.id?;
                let name = s
                    .names
                    .and_then(|n| n.into_iter().next())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string();
                Some(ContainerInfo {
                    id,
                    name,
                    running: s.state.as_deref() == Some("running"),
                    labels: to_btree(s.labels),
                })
            })
            .collect())
    }
}
