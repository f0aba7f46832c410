//! fleetgrid-lifecycle — turns registry intent into running containers.
//!
//! The [`LifecycleController`] is the only component that talks to a
//! [`ContainerRuntime`]. Runtime calls run on a bounded worker pool with
//! a per-call deadline, so a hung runtime never stalls the registry.

pub mod backoff;
pub mod controller;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod memory;
pub mod runtime;

pub use backoff::BackoffPolicy;
pub use controller::{AgentChannel, LifecycleController, LifecycleSettings, ReconcileReport};
#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use error::{LifecycleError, LifecycleResult, RuntimeError, RuntimeResult};
pub use memory::MemoryRuntime;
pub use runtime::{ContainerInfo, ContainerRuntime, ContainerSpec};
