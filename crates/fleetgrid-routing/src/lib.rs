//! fleetgrid-routing — proxy routing tables.
//!
//! The [`RoutingPublisher`] is registered as a registry transition
//! listener. It runs under the group lock of the instance that moved, so
//! the update for a transition is queued before any later transition of
//! that group is applied.
//!
//! ```text
//! subscribe   ─► RoutingUpdate{full=true}  complete ONLINE set per group
//! → ONLINE    ─► RoutingUpdate{full=false} entry with address and port
//! ONLINE →    ─► RoutingUpdate{full=false} entry with port 0 (removal)
//! ```

pub mod publisher;

pub use publisher::{ConnectionId, RoutingPublisher, UpdateSink};
