use std::time::Duration;

use fleetgrid_state::{InstanceState, RegistryError};
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Failures reported by a container runtime backend.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("provisioning {instance} failed after {attempts} attempt(s): {last_error}")]
    ProvisionFailed {
        instance: String,
        attempts: u32,
        last_error: String,
    },

    #[error("runtime {op} call timed out after {after:?}")]
    RuntimeTimeout { op: &'static str, after: Duration },

    #[error("instance {instance} cannot be terminated while {state}")]
    NotTerminable {
        instance: String,
        state: InstanceState,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
