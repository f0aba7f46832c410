//! Demand signals.

use std::sync::Arc;

use fleetgrid_state::{GroupSnapshot, SignalKind};

/// Computes the per-instance load of a group.
///
/// Returns `None` when there is nothing to measure (no ONLINE instance).
pub trait DemandSignal: Send + Sync {
    fn name(&self) -> &'static str;
    fn load(&self, group: &GroupSnapshot) -> Option<f64>;
}

/// Mean player count of the ONLINE instances.
pub struct PlayersPerInstance;

impl DemandSignal for PlayersPerInstance {
    fn name(&self) -> &'static str {
        "players_per_instance"
    }

    fn load(&self, group: &GroupSnapshot) -> Option<f64> {
        let (count, players) = group
            .online()
            .fold((0u32, 0u64), |(n, p), i| (n + 1, p + i.player_count as u64));
        (count > 0).then(|| players as f64 / count as f64)
    }
}

/// Players divided by the capacity of the ONLINE instances.
pub struct Utilization;

impl DemandSignal for Utilization {
    fn name(&self) -> &'static str {
        "utilization"
    }

    fn load(&self, group: &GroupSnapshot) -> Option<f64> {
        let per_instance = group.spec.policy.max_players;
        let players = PlayersPerInstance.load(group)?;
        (per_instance > 0).then(|| players / per_instance as f64)
    }
}

/// Mean load metric reported by the agents.
pub struct LoadMetric;

impl DemandSignal for LoadMetric {
    fn name(&self) -> &'static str {
        "load_metric"
    }

    fn load(&self, group: &GroupSnapshot) -> Option<f64> {
        let (count, total) = group
            .online()
            .fold((0u32, 0.0f64), |(n, t), i| (n + 1, t + i.load_metric));
        (count > 0).then(|| total / count as f64)
    }
}

/// The built-in signal selected by a policy.
pub fn builtin(kind: SignalKind) -> Arc<dyn DemandSignal> {
    match kind {
        SignalKind::PlayersPerInstance => Arc::new(PlayersPerInstance),
        SignalKind::Utilization => Arc::new(Utilization),
        SignalKind::LoadMetric => Arc::new(LoadMetric),
    }
}
