//! Autoscaler — evaluates group demand and applies scaling decisions.
//!
//! Decisions are computed from a registry snapshot and applied through the
//! lifecycle controller. Per-group scaling state is held behind an async
//! mutex for the whole apply, so a tick and a manual scale of the same
//! group never interleave while different groups scale concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fleetgrid_lifecycle::{LifecycleController, LifecycleError, LifecycleResult};
use fleetgrid_state::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::signal::{DemandSignal, builtin};

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    BelowMinimum,
    AboveMaximum,
    DemandHigh,
    DemandLow,
    Manual,
}

impl fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScaleReason::BelowMinimum => "below_minimum",
            ScaleReason::AboveMaximum => "above_maximum",
            ScaleReason::DemandHigh => "demand_high",
            ScaleReason::DemandLow => "demand_low",
            ScaleReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A signed change to one group's instance count. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingDecision {
    pub group: GroupName,
    pub delta: i32,
    pub reason: ScaleReason,
    pub at_ms: u64,
}

/// Per-group cooldown tracking.
#[derive(Debug, Default)]
struct ScaleState {
    last_applied_ms: Option<u64>,
}

type ScaleSlot = Arc<tokio::sync::Mutex<ScaleState>>;

struct Inner {
    lifecycle: LifecycleController,
    /// Per-group signal overrides.
    signals: RwLock<HashMap<GroupName, Arc<dyn DemandSignal>>>,
    states: Mutex<HashMap<GroupName, ScaleSlot>>,
}

/// Cheap to clone; clones share cooldown state.
#[derive(Clone)]
pub struct Autoscaler {
    inner: Arc<Inner>,
}

impl Autoscaler {
    pub fn new(lifecycle: LifecycleController) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                signals: RwLock::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Use `signal` for `group` instead of the policy's built-in one.
    pub fn with_signal(self, group: impl Into<GroupName>, signal: Arc<dyn DemandSignal>) -> Self {
        self.set_signal(group, signal);
        self
    }

    pub fn set_signal(&self, group: impl Into<GroupName>, signal: Arc<dyn DemandSignal>) {
        self.inner
            .signals
            .write()
            .expect("signals lock")
            .insert(group.into(), signal);
    }

    fn registry(&self) -> &Registry {
        self.inner.lifecycle.registry()
    }

    fn signal_for(&self, group: &GroupSnapshot) -> Arc<dyn DemandSignal> {
        self.inner
            .signals
            .read()
            .expect("signals lock")
            .get(group.name())
            .cloned()
            .unwrap_or_else(|| builtin(group.spec.policy.signal))
    }

    fn slot(&self, group: &str) -> ScaleSlot {
        self.inner
            .states
            .lock()
            .expect("states lock")
            .entry(group.to_string())
            .or_default()
            .clone()
    }

    /// Evaluate one group as of `now_ms` without applying anything.
    ///
    /// Returns `None` while a decision for the group is being applied.
    pub fn evaluate(&self, group: &GroupSnapshot, now_ms: u64) -> Option<ScalingDecision> {
        let slot = self.slot(group.name());
        let state = slot.try_lock().ok()?;
        self.decide(group, state.last_applied_ms, now_ms)
    }

    fn decide(
        &self,
        group: &GroupSnapshot,
        last_applied_ms: Option<u64>,
        now_ms: u64,
    ) -> Option<ScalingDecision> {
        let name = group.name();
        if group.paused {
            return None;
        }
        if group.draining() {
            debug!(group = %name, "drain in progress, skipping evaluation");
            return None;
        }

        let policy = &group.spec.policy;
        let active = group.active_count() as i64;
        let decision = |delta: i64, reason| ScalingDecision {
            group: name.to_string(),
            delta: delta as i32,
            reason,
            at_ms: now_ms,
        };

        if active < policy.min_instances as i64 {
            return Some(decision(
                policy.min_instances as i64 - active,
                ScaleReason::BelowMinimum,
            ));
        }
        if active > policy.max_instances as i64 {
            return Some(decision(
                policy.max_instances as i64 - active,
                ScaleReason::AboveMaximum,
            ));
        }

        let signal = self.signal_for(group);
        let load = signal.load(group)?;

        let (delta, reason) = if load >= policy.scale_up_threshold {
            let wanted = (active as f64 * load / policy.scale_up_threshold).ceil() as i64;
            ((wanted - active).max(1), ScaleReason::DemandHigh)
        } else if load <= policy.scale_down_threshold {
            (-1, ScaleReason::DemandLow)
        } else {
            return None;
        };

        let target = (active + delta).clamp(policy.min_instances as i64, policy.max_instances as i64);
        let delta = target - active;
        if delta == 0 {
            return None;
        }

        let cooldown_ms = policy.cooldown_secs.saturating_mul(1000);
        if let Some(last) = last_applied_ms
            && now_ms.saturating_sub(last) < cooldown_ms
        {
            debug!(
                group = %name,
                delta,
                remaining_ms = cooldown_ms - now_ms.saturating_sub(last),
                "decision suppressed by cooldown"
            );
            return None;
        }

        debug!(
            group = %name,
            signal = signal.name(),
            load,
            active,
            delta,
            %reason,
            "scaling decision"
        );
        Some(decision(delta, reason))
    }

    /// Evaluate and apply every group now.
    pub async fn tick(&self) -> Vec<ScalingDecision> {
        self.tick_at(epoch_millis()).await
    }

    /// Evaluate and apply every group as of `now_ms`.
    ///
    /// Groups are handled concurrently; a failure in one group is logged
    /// and does not affect the others. Returns the applied decisions.
    pub async fn tick_at(&self, now_ms: u64) -> Vec<ScalingDecision> {
        let tasks: Vec<_> = self
            .registry()
            .group_names()
            .into_iter()
            .map(|name| {
                let this = self.clone();
                tokio::spawn(async move {
                    match this.tick_group(&name, now_ms).await {
                        Ok(applied) => applied,
                        Err(e) => {
                            warn!(group = %name, error = %e, "scaling failed");
                            None
                        }
                    }
                })
            })
            .collect();

        let mut applied = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Some(decision)) => applied.push(decision),
                Ok(None) => {}
                Err(e) => error!(error = %e, "scaling task panicked"),
            }
        }
        applied
    }

    async fn tick_group(&self, name: &str, now_ms: u64) -> LifecycleResult<Option<ScalingDecision>> {
        let slot = self.slot(name);
        let Ok(mut state) = slot.try_lock() else {
            debug!(group = %name, "previous decision still applying");
            return Ok(None);
        };
        let Some(group) = self.registry().group(name) else {
            return Ok(None);
        };
        let Some(decision) = self.decide(&group, state.last_applied_ms, now_ms) else {
            return Ok(None);
        };
        let applied = self.apply(&mut state, &group, &decision).await?;
        Ok(applied.then_some(decision))
    }

    /// Manually scale a group to `target` instances.
    ///
    /// The target is clamped to the policy bounds and applied through the
    /// same path as automatic decisions. The cooldown is not checked but
    /// is restarted.
    pub async fn scale_to(
        &self,
        name: &str,
        target: u32,
    ) -> LifecycleResult<Option<ScalingDecision>> {
        let slot = self.slot(name);
        let mut state = slot.lock().await;
        let group = self
            .registry()
            .group(name)
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;

        let target = group.spec.policy.clamp(target);
        let delta = target as i64 - group.active_count() as i64;
        if delta == 0 {
            self.registry().set_desired(name, target)?;
            return Ok(None);
        }

        let decision = ScalingDecision {
            group: name.to_string(),
            delta: delta as i32,
            reason: ScaleReason::Manual,
            at_ms: epoch_millis(),
        };
        let applied = self.apply(&mut state, &group, &decision).await?;
        Ok(applied.then_some(decision))
    }

    /// Returns `false` if the decision was deferred.
    async fn apply(
        &self,
        state: &mut ScaleState,
        group: &GroupSnapshot,
        decision: &ScalingDecision,
    ) -> LifecycleResult<bool> {
        let name = group.name();
        let active = group.active_count();
        let registry = self.registry();

        if decision.delta > 0 {
            let count = decision.delta as u32;
            match self.inner.lifecycle.provision(name, count).await {
                Ok(started) => {
                    info!(
                        group = %name,
                        requested = count,
                        started = started.len(),
                        reason = %decision.reason,
                        "scaled up"
                    );
                    if !started.is_empty() {
                        registry.set_desired(name, active + started.len() as u32)?;
                    }
                }
                Err(LifecycleError::Registry(e @ RegistryError::PortExhausted { .. })) => {
                    warn!(group = %name, error = %e, "scale-up deferred");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        } else {
            let online: Vec<InstanceId> = group.online().map(|i| i.id.clone()).collect();
            let victims: Vec<InstanceId> = online
                .into_iter()
                .rev()
                .take(decision.delta.unsigned_abs() as usize)
                .collect();
            if victims.is_empty() {
                debug!(group = %name, "no ONLINE instance to remove");
                return Ok(false);
            }

            for id in &victims {
                let lifecycle = self.inner.lifecycle.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = lifecycle.terminate(&id, TerminationReason::ScaledDown).await {
                        warn!(instance = %id, error = %e, "scale-down termination failed");
                    }
                });
            }
            info!(
                group = %name,
                removing = ?victims,
                reason = %decision.reason,
                "scaling down"
            );
            registry.set_desired(name, active.saturating_sub(victims.len() as u32))?;
        }

        state.last_applied_ms = Some(decision.at_ms);
        Ok(true)
    }

    /// Run the autoscaler loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::tests::group;
    use fleetgrid_lifecycle::{BackoffPolicy, LifecycleSettings, MemoryRuntime};
    use std::collections::BTreeMap;

    fn lobby() -> GroupSpec {
        GroupSpec {
            name: "lobby".to_string(),
            platform: Platform::Paper,
            policy: GroupPolicy {
                min_instances: 1,
                max_instances: 5,
                scale_up_threshold: 20.0,
                scale_down_threshold: 5.0,
                cooldown_secs: 30,
                signal: SignalKind::PlayersPerInstance,
                max_players: 50,
            },
            template: ContainerTemplate {
                image: "lobby:latest".to_string(),
                memory_bytes: 0,
                cpu_millis: 0,
                env: BTreeMap::new(),
                command: None,
                port_range: PortRange {
                    start: 30000,
                    end: 30009,
                },
                host_address: "127.0.0.1".to_string(),
            },
        }
    }

    fn setup() -> (Registry, Arc<MemoryRuntime>, Autoscaler) {
        let registry = Registry::new();
        registry.create_group(lobby()).unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let settings = LifecycleSettings {
            call_deadline: Duration::from_millis(200),
            backoff: BackoffPolicy {
                first: Duration::from_millis(1),
                max: Duration::from_millis(2),
                factor: 2.0,
            },
            drain_grace: Duration::from_millis(20),
            ..LifecycleSettings::default()
        };
        let lifecycle = LifecycleController::new(registry.clone(), runtime.clone(), settings);
        (registry, runtime, Autoscaler::new(lifecycle))
    }

    fn bring_online(registry: &Registry, id: &str, players: u32) {
        registry
            .record_heartbeat(
                id,
                1,
                HeartbeatMetrics {
                    player_count: players,
                    load_metric: 0.0,
                },
                epoch_millis(),
            )
            .unwrap();
        registry
            .apply_transition(id, TransitionEvent::HeartbeatOk)
            .unwrap();
    }

    fn scaler_only() -> Autoscaler {
        setup().2
    }

    #[test]
    fn demand_above_threshold_scales_up() {
        let scaler = scaler_only();
        let g = group(&[(InstanceState::Online, 25, 0.0)]);
        let d = scaler.evaluate(&g, 1_000).unwrap();
        assert_eq!(d.delta, 1);
        assert_eq!(d.reason, ScaleReason::DemandHigh);
    }

    #[test]
    fn large_spike_scales_proportionally_within_max() {
        let scaler = scaler_only();
        let g = group(&[
            (InstanceState::Online, 60, 0.0),
            (InstanceState::Online, 60, 0.0),
        ]);
        // ceil(2 * 60 / 20) = 6, clamped to max 5.
        assert_eq!(scaler.evaluate(&g, 1_000).unwrap().delta, 3);
    }

    #[test]
    fn demand_below_threshold_removes_one() {
        let scaler = scaler_only();
        let g = group(&[
            (InstanceState::Online, 1, 0.0),
            (InstanceState::Online, 2, 0.0),
        ]);
        let d = scaler.evaluate(&g, 1_000).unwrap();
        assert_eq!(d.delta, -1);
        assert_eq!(d.reason, ScaleReason::DemandLow);
    }

    #[test]
    fn never_scales_below_minimum() {
        let scaler = scaler_only();
        let g = group(&[(InstanceState::Online, 0, 0.0)]);
        assert_eq!(scaler.evaluate(&g, 1_000), None);
    }

    #[test]
    fn bounds_are_enforced_first() {
        let scaler = scaler_only();
        let d = scaler.evaluate(&group(&[]), 1_000).unwrap();
        assert_eq!((d.delta, d.reason), (1, ScaleReason::BelowMinimum));

        let six = [(InstanceState::Online, 10, 0.0); 6];
        let d = scaler.evaluate(&group(&six), 1_000).unwrap();
        assert_eq!((d.delta, d.reason), (-1, ScaleReason::AboveMaximum));
    }

    #[test]
    fn paused_and_draining_groups_are_skipped() {
        let scaler = scaler_only();
        let mut g = group(&[(InstanceState::Online, 50, 0.0)]);
        g.paused = true;
        assert_eq!(scaler.evaluate(&g, 1_000), None);

        let g = group(&[
            (InstanceState::Online, 50, 0.0),
            (InstanceState::Draining, 0, 0.0),
        ]);
        assert_eq!(scaler.evaluate(&g, 1_000), None);
    }

    #[test]
    fn custom_signal_overrides_policy() {
        struct Fixed(f64);
        impl DemandSignal for Fixed {
            fn name(&self) -> &'static str {
                "fixed"
            }
            fn load(&self, _group: &GroupSnapshot) -> Option<f64> {
                Some(self.0)
            }
        }

        let scaler = scaler_only().with_signal("lobby", Arc::new(Fixed(100.0)));
        let g = group(&[(InstanceState::Online, 0, 0.0)]);
        assert_eq!(scaler.evaluate(&g, 1_000).unwrap().delta, 4);
    }

    #[tokio::test]
    async fn spike_scales_once_per_cooldown() {
        let (registry, runtime, scaler) = setup();

        let applied = scaler.tick_at(1_000).await;
        assert_eq!(applied[0].reason, ScaleReason::BelowMinimum);
        let first = registry.group("lobby").unwrap().instances[0].id.clone();
        bring_online(&registry, &first, 25);

        // The minimum top-up started the cooldown window.
        assert!(scaler.tick_at(2_000).await.is_empty());

        let applied = scaler.tick_at(31_000).await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].delta, 1);
        let g = registry.group("lobby").unwrap();
        assert_eq!(g.instances.len(), 2);
        assert_eq!(g.desired_count, 2);
        assert_eq!(runtime.running_count(), 2);

        // Still 25 players per ONLINE instance, but inside the window.
        assert!(scaler.tick_at(40_000).await.is_empty());
        assert!(scaler.tick_at(60_999).await.is_empty());
        let applied = scaler.tick_at(61_000).await;
        assert_eq!(applied.len(), 1);
        assert_eq!(registry.group("lobby").unwrap().instances.len(), 3);
    }

    #[tokio::test]
    async fn scale_down_removes_newest_online_instance() {
        let (registry, _runtime, scaler) = setup();
        let ids = scaler
            .inner
            .lifecycle
            .provision("lobby", 3)
            .await
            .unwrap();
        for id in &ids {
            bring_online(&registry, id, 1);
        }

        let applied = scaler.tick_at(1_000).await;
        assert_eq!(applied[0].reason, ScaleReason::DemandLow);

        let newest = ids.last().unwrap();
        let mut state = registry.instance(newest).map(|i| i.state);
        for _ in 0..100 {
            if state != Some(InstanceState::Online) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = registry.instance(newest).map(|i| i.state);
        }
        assert_ne!(state, Some(InstanceState::Online));
        assert_eq!(
            registry.instance(&ids[0]).unwrap().state,
            InstanceState::Online
        );
        assert_eq!(registry.group("lobby").unwrap().desired_count, 2);
    }

    #[tokio::test]
    async fn exhausted_ports_defer_without_cooldown() {
        let (registry, _runtime, scaler) = setup();
        let mut narrow = lobby();
        narrow.name = "tiny".to_string();
        narrow.policy.min_instances = 0;
        narrow.policy.max_instances = 1;
        narrow.template.port_range = PortRange {
            start: 30000,
            end: 30000,
        };
        registry.create_group(narrow).unwrap();

        // lobby's first instance takes 30000.
        scaler.scale_to("lobby", 1).await.unwrap();
        assert_eq!(scaler.scale_to("tiny", 1).await.unwrap(), None);
        assert!(registry.group("tiny").unwrap().instances.is_empty());

        let slot = scaler.slot("tiny");
        assert_eq!(slot.lock().await.last_applied_ms, None);
    }

    #[tokio::test]
    async fn failed_provisioning_leaves_desired_unchanged() {
        let (registry, runtime, scaler) = setup();
        runtime.fail_creates(3);

        scaler.tick_at(1_000).await;
        let g = registry.group("lobby").unwrap();
        assert!(g.instances.is_empty());
        assert_eq!(g.desired_count, 1);
        assert_eq!(g.terminations[0].reason, TerminationReason::ProvisionFailed);
        assert!(!g.alerts.is_empty());
    }

    #[tokio::test]
    async fn manual_scale_is_clamped() {
        let (registry, _runtime, scaler) = setup();
        let d = scaler.scale_to("lobby", 50).await.unwrap().unwrap();
        assert_eq!(d.delta, 5);
        assert_eq!(d.reason, ScaleReason::Manual);
        assert_eq!(registry.group("lobby").unwrap().desired_count, 5);

        assert!(matches!(
            scaler.scale_to("missing", 1).await,
            Err(LifecycleError::Registry(RegistryError::GroupNotFound(_)))
        ));
    }
}
