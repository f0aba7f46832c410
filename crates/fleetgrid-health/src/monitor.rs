//! Health monitor — heartbeat intake and the periodic staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_state::*;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::thresholds::{HealthThresholds, ThresholdTable};

/// Callback invoked with instances the sweep moved to STOPPING.
///
/// The lifecycle controller registers one to remove their containers.
pub type ReclaimHandler = Arc<dyn Fn(InstanceId) -> ReclaimFuture + Send + Sync>;

pub type ReclaimFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// What happened to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Metrics recorded; state unchanged.
    Recorded(InstanceState),
    /// Metrics recorded and the instance became ONLINE.
    Online { from: InstanceState },
    /// Timestamp not newer than the last accepted heartbeat.
    Dropped,
    /// The instance already terminated.
    Stale,
}

/// Instances moved by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// STARTING → UNRESPONSIVE.
    pub timed_out: Vec<InstanceId>,
    /// ONLINE → UNRESPONSIVE.
    pub missed: Vec<InstanceId>,
    /// UNRESPONSIVE → STOPPING.
    pub reclaimed: Vec<InstanceId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.missed.is_empty() && self.reclaimed.is_empty()
    }
}

pub struct HealthMonitor {
    registry: Registry,
    thresholds: ThresholdTable,
    on_reclaim: Option<ReclaimHandler>,
}

impl HealthMonitor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            thresholds: ThresholdTable::default(),
            on_reclaim: None,
        }
    }

    /// Thresholds for platforms without an override.
    pub fn with_default_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds.default = thresholds;
        self
    }

    pub fn with_platform_thresholds(
        mut self,
        platform: Platform,
        thresholds: HealthThresholds,
    ) -> Self {
        self.thresholds.platforms.insert(platform, thresholds);
        self
    }

    /// Set the handler receiving reclaimed instances.
    pub fn with_reclaim_handler(mut self, handler: ReclaimHandler) -> Self {
        self.on_reclaim = Some(handler);
        self
    }

    pub fn thresholds(&self, platform: Platform) -> HealthThresholds {
        self.thresholds.get(platform)
    }

    /// Record a heartbeat received now.
    pub fn on_heartbeat(
        &self,
        id: &str,
        metrics: HeartbeatMetrics,
        timestamp: u64,
    ) -> RegistryResult<HeartbeatOutcome> {
        self.on_heartbeat_at(id, metrics, timestamp, epoch_millis())
    }

    /// Record a heartbeat received at `now_ms`.
    ///
    /// Heartbeats must carry strictly increasing agent timestamps; anything
    /// else is a reordered or duplicated packet and is dropped.
    pub fn on_heartbeat_at(
        &self,
        id: &str,
        metrics: HeartbeatMetrics,
        timestamp: u64,
        now_ms: u64,
    ) -> RegistryResult<HeartbeatOutcome> {
        let state = match self
            .registry
            .record_heartbeat(id, timestamp, metrics, now_ms)?
        {
            HeartbeatRecord::Accepted(state) => state,
            HeartbeatRecord::Dropped { last } => {
                debug!(instance = %id, timestamp, last, "out-of-order heartbeat dropped");
                return Ok(HeartbeatOutcome::Dropped);
            }
            HeartbeatRecord::Stale => return Ok(HeartbeatOutcome::Stale),
        };

        if !matches!(state, InstanceState::Starting | InstanceState::Unresponsive) {
            return Ok(HeartbeatOutcome::Recorded(state));
        }

        match self
            .registry
            .apply_transition_at(id, TransitionEvent::HeartbeatOk, now_ms)
        {
            Ok(TransitionOutcome::Applied { from, .. }) => {
                if from == InstanceState::Unresponsive {
                    info!(instance = %id, "instance recovered");
                }
                Ok(HeartbeatOutcome::Online { from })
            }
            Ok(TransitionOutcome::Stale) => Ok(HeartbeatOutcome::Stale),
            // The state moved between recording and transitioning.
            Err(RegistryError::InvalidTransition { from, .. }) => {
                Ok(HeartbeatOutcome::Recorded(from))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the staleness rules to every instance as of `now_ms`.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for group in self.registry.groups() {
            let limits = self.thresholds.get(group.spec.platform);
            for instance in &group.instances {
                self.check_instance(instance, &limits, now_ms, &mut report);
            }
        }

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out.len(),
                missed = report.missed.len(),
                reclaimed = report.reclaimed.len(),
                "health sweep moved instances"
            );
        }
        report
    }

    fn check_instance(
        &self,
        instance: &InstanceSnapshot,
        limits: &HealthThresholds,
        now_ms: u64,
        report: &mut SweepReport,
    ) {
        let Some(event) = overdue(instance, limits, now_ms) else {
            return;
        };
        let reason = (event == TransitionEvent::ReclaimTimeout).then_some(TerminationReason::Reclaimed);

        // The snapshot may be old by now; the rule is evaluated again under the lock.
        let result = self.registry.apply_transition_if(&instance.id, event, reason, now_ms, |current| {
            overdue(current, limits, now_ms) == Some(event)
        });

        match result {
            Ok(Some(TransitionOutcome::Applied { .. })) => {
                warn!(
                    group = %instance.group,
                    instance = %instance.id,
                    ?event,
                    silent_ms = now_ms.saturating_sub(instance.last_seen_ms),
                    "instance health degraded"
                );
                let bucket = match event {
                    TransitionEvent::Timeout => &mut report.timed_out,
                    TransitionEvent::HeartbeatMissed => &mut report.missed,
                    _ => &mut report.reclaimed,
                };
                bucket.push(instance.id.clone());
            }
            Ok(Some(TransitionOutcome::Stale)) => {}
            Ok(None) => debug!(instance = %instance.id, ?event, "instance recovered before the sweep applied"),
            Err(e) => debug!(instance = %instance.id, error = %e, "sweep transition skipped"),
        }
    }

    /// Sweep now and hand reclaimed instances to the reclaim handler.
    pub async fn tick(&self) -> SweepReport {
        let report = self.sweep_at(epoch_millis());
        if let Some(handler) = &self.on_reclaim {
            for id in &report.reclaimed {
                let fut = handler(id.clone());
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        warn!(instance = %id, error = %e, "reclaim failed");
                    }
                });
            }
        }
        report
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Event the staleness rules fire for `instance` at `now_ms`, if any.
fn overdue(instance: &InstanceSnapshot, limits: &HealthThresholds, now_ms: u64) -> Option<TransitionEvent> {
    let since_state = now_ms.saturating_sub(instance.state_since_ms);
    let silent_for = now_ms.saturating_sub(instance.last_seen_ms);

    match instance.state {
        InstanceState::Starting if since_state > millis(limits.startup_timeout) => {
            Some(TransitionEvent::Timeout)
        }
        InstanceState::Online if silent_for > millis(limits.missed_after) => {
            Some(TransitionEvent::HeartbeatMissed)
        }
        InstanceState::Unresponsive if silent_for > millis(limits.reclaim_after) => {
            Some(TransitionEvent::ReclaimTimeout)
        }
        _ => None,
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
