//! Error types for the registry and the group store.

use thiserror::Error;

use crate::machine::{InstanceState, TransitionEvent};

/// Result type alias for group store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised by the redb-backed group store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Errors raised by the in-memory registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("group already exists: {0}")]
    GroupExists(String),

    #[error("group {0} still has {1} instance(s)")]
    GroupNotEmpty(String, usize),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("invalid policy for group {group}: {reason}")]
    InvalidPolicy { group: String, reason: String },

    #[error("invalid transition for {instance}: {event:?} not allowed from {from:?}")]
    InvalidTransition {
        instance: String,
        from: InstanceState,
        event: TransitionEvent,
    },

    #[error("no free port left in range {start}-{end} for group {group}")]
    PortExhausted { group: String, start: u16, end: u16 },
}
