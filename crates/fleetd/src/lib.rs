//! fleetd — assembles the fleetgrid subsystems.
//!
//! Every component receives its collaborators at construction:
//!
//! ```text
//! GroupStore ──► Registry ◄── RoutingPublisher (transition listener)
//!                   ▲
//!   LifecycleController ◄── ContainerRuntime (memory | docker)
//!      ▲        ▲      ▲
//!      │        │      └── ControlServer ── ConnectionTable (agent channel)
//!      │   Autoscaler           │
//!      └── HealthMonitor ◄──────┘ heartbeats
//! ```

pub mod fleet;

pub use fleet::{Fleet, FleetTasks};
