//! fleetgrid-autoscale — demand-driven group scaling.
//!
//! Each tick evaluates every group independently. The group's
//! [`DemandSignal`] turns the ONLINE instances into a per-instance load,
//! which is compared against the policy thresholds.
//!
//! # Scaling Algorithm
//!
//! ```text
//! paused or draining            → no decision
//! active < min                  → +(min - active)       BelowMinimum
//! active > max                  → -(active - max)       AboveMaximum
//! load >= scale_up_threshold    → max(1, ceil(active * load / up) - active)
//! load <= scale_down_threshold  → -1
//! ```
//!
//! Deltas are clamped so the desired count stays in `[min, max]`. Demand
//! decisions are suppressed inside the cooldown window since the last
//! applied decision. Scale-down removes the newest ONLINE instances first.

pub mod scaler;
pub mod signal;

pub use scaler::{Autoscaler, ScaleReason, ScalingDecision};
pub use signal::{DemandSignal, LoadMetric, PlayersPerInstance, Utilization, builtin};
