//! fleetgrid-health — heartbeat-driven instance health.
//!
//! Agents report heartbeats over the control protocol; the
//! [`HealthMonitor`] records them and periodically sweeps the registry for
//! instances that went quiet.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── on_heartbeat()  ordering check, metrics, STARTING/UNRESPONSIVE → ONLINE
//!   ├── sweep_at(now)   per-platform HealthThresholds
//!   │     STARTING     older than startup_timeout → Timeout
//!   │     ONLINE       silent for missed_after    → HeartbeatMissed
//!   │     UNRESPONSIVE silent for reclaim_after   → ReclaimTimeout
//!   └── ReclaimHandler  hands STOPPING instances to the lifecycle controller
//! ```

pub mod monitor;
pub mod thresholds;

pub use monitor::{HealthMonitor, HeartbeatOutcome, ReclaimFuture, ReclaimHandler, SweepReport};
pub use thresholds::HealthThresholds;
