//! fleetgrid-state — authoritative fleet state.
//!
//! Holds the in-memory [`Registry`] of server groups and their instances,
//! the instance lifecycle state machine, and a redb-backed [`GroupStore`]
//! that persists group definitions across restarts.
//!
//! # Architecture
//!
//! ```text
//! Registry (Clone, Arc inside)
//!   ├── groups: name → Arc<Mutex<GroupEntry>>   (one writer per group)
//!   ├── index:  instance id → group name
//!   ├── ports:  host-wide PortLedger            (locked after a group lock)
//!   ├── tombstones of recently terminated ids   (stale-event detection)
//!   └── TransitionListener fan-out              (called under the group lock)
//!
//! GroupStore (redb)
//!   └── groups table: name → JSON GroupSpec
//! ```
//!
//! Instance state is never persisted; it is rebuilt from the container
//! runtime on startup.

pub mod error;
pub mod machine;
pub mod ports;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult, StateError, StateResult};
pub use machine::{InstanceState, TransitionEvent};
pub use ports::PortLedger;
pub use registry::{
    HeartbeatRecord, Registry, TransitionListener, TransitionOutcome, TransitionRecord,
};
pub use store::GroupStore;
pub use types::*;
