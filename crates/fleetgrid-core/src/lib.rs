//! fleetgrid-core — daemon configuration.
//!
//! `fleet.toml` describes the control listener, the management API, the
//! health and autoscaler cadence, the container runtime, and the initial
//! set of server groups.

pub mod config;
pub mod duration;

pub use config::*;
pub use duration::parse_duration;
