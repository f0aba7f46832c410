//! Registry — the single source of truth for groups and instances.
//!
//! Every group sits behind its own mutex, so transitions for instances of
//! one group are serialized while different groups proceed in parallel.
//! The host-wide [`PortLedger`] is only ever locked while a group lock is
//! held, never the other way around.
//!
//! Listeners registered with [`Registry::add_listener`] run synchronously
//! under the group lock after each applied transition. They must not call
//! back into the registry for the same group.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::machine::{InstanceState, TransitionEvent};
use crate::ports::PortLedger;
use crate::types::*;

const ALERT_CAPACITY: usize = 32;
const TERMINATION_CAPACITY: usize = 16;
const TOMBSTONE_CAPACITY: usize = 4096;

/// Result of applying a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: InstanceState,
        to: InstanceState,
    },
    /// The instance was already terminated; the event was ignored.
    Stale,
}

/// Result of recording a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatRecord {
    /// Metrics were stored. Carries the instance's current state.
    Accepted(InstanceState),
    /// Timestamp not newer than the last accepted one.
    Dropped { last: u64 },
    /// The instance was already terminated.
    Stale,
}

/// Passed to every [`TransitionListener`] after an applied transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub group: GroupName,
    /// Instance view after the transition.
    pub instance: InstanceSnapshot,
    pub from: InstanceState,
    pub to: InstanceState,
}

impl TransitionRecord {
    pub fn entered_online(&self) -> bool {
        self.to == InstanceState::Online && self.from != InstanceState::Online
    }

    pub fn left_online(&self) -> bool {
        self.from == InstanceState::Online && self.to != InstanceState::Online
    }
}

/// Observer of state transitions.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, record: &TransitionRecord);
}

struct InstanceRecord {
    view: InstanceSnapshot,
    pending_reason: Option<TerminationReason>,
}

struct GroupEntry {
    spec: GroupSpec,
    desired: u32,
    paused: bool,
    next_seq: u64,
    instances: Vec<InstanceRecord>,
    alerts: VecDeque<GroupAlert>,
    terminations: VecDeque<TerminatedInstance>,
}

impl GroupEntry {
    fn new(spec: GroupSpec) -> Self {
        Self {
            desired: spec.policy.min_instances,
            spec,
            paused: false,
            next_seq: 1,
            instances: Vec::new(),
            alerts: VecDeque::new(),
            terminations: VecDeque::new(),
        }
    }

    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            spec: self.spec.clone(),
            desired_count: self.desired,
            paused: self.paused,
            instances: self.instances.iter().map(|r| r.view.clone()).collect(),
            alerts: self.alerts.iter().cloned().collect(),
            terminations: self.terminations.iter().cloned().collect(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.instances.iter().position(|r| r.view.id == id)
    }

    fn push_alert(&mut self, alert: GroupAlert) {
        if self.alerts.len() == ALERT_CAPACITY {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    fn push_termination(&mut self, record: TerminatedInstance) {
        if self.terminations.len() == TERMINATION_CAPACITY {
            self.terminations.pop_front();
        }
        self.terminations.push_back(record);
    }

    /// Parse the sequence number out of `{group}-{seq}`.
    fn seq_of(&self, id: &str) -> Option<u64> {
        id.strip_prefix(self.spec.name.as_str())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}

/// Bounded set of recently terminated instance ids.
#[derive(Default)]
struct Tombstones {
    order: VecDeque<InstanceId>,
    ids: HashSet<InstanceId>,
}

impl Tombstones {
    fn insert(&mut self, id: InstanceId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > TOMBSTONE_CAPACITY
            && let Some(old) = self.order.pop_front()
        {
            self.ids.remove(&old);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Default)]
struct Inner {
    groups: RwLock<HashMap<GroupName, Arc<Mutex<GroupEntry>>>>,
    index: RwLock<HashMap<InstanceId, GroupName>>,
    ports: Mutex<PortLedger>,
    tombstones: Mutex<Tombstones>,
    listeners: RwLock<Vec<Arc<dyn TransitionListener>>>,
}

/// In-memory registry of groups and instances. Cheap to clone.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for applied transitions.
    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) {
        self.inner
            .listeners
            .write()
            .expect("listeners lock")
            .push(listener);
    }

    // ── Groups ────────────────────────────────────────────────────

    /// Register a new group.
    pub fn create_group(&self, spec: GroupSpec) -> RegistryResult<GroupName> {
        spec.validate().map_err(|reason| RegistryError::InvalidPolicy {
            group: spec.name.clone(),
            reason,
        })?;

        let mut groups = self.inner.groups.write().expect("groups lock");
        if groups.contains_key(&spec.name) {
            return Err(RegistryError::GroupExists(spec.name));
        }
        let name = spec.name.clone();
        info!(group = %name, platform = ?spec.platform, "group created");
        groups.insert(name.clone(), Arc::new(Mutex::new(GroupEntry::new(spec))));
        Ok(name)
    }

    /// Replace a group's scaling policy. `desired_count` is re-clamped.
    pub fn update_policy(&self, name: &str, policy: GroupPolicy) -> RegistryResult<()> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().expect("group lock");

        let mut candidate = entry.spec.clone();
        candidate.policy = policy;
        candidate
            .validate()
            .map_err(|reason| RegistryError::InvalidPolicy {
                group: name.to_string(),
                reason,
            })?;

        entry.desired = candidate.policy.clamp(entry.desired);
        entry.spec = candidate;
        info!(group = %name, desired = entry.desired, "group policy updated");
        Ok(())
    }

    /// Remove a group. Only allowed once it has no instances left.
    pub fn delete_group(&self, name: &str) -> RegistryResult<()> {
        let mut groups = self.inner.groups.write().expect("groups lock");
        let entry = groups
            .get(name)
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;
        let remaining = entry.lock().expect("group lock").instances.len();
        if remaining > 0 {
            return Err(RegistryError::GroupNotEmpty(name.to_string(), remaining));
        }
        groups.remove(name);
        info!(group = %name, "group deleted");
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<GroupSnapshot> {
        self.group_with(name, GroupSnapshot::clone)
    }

    /// Run `f` on a snapshot of the group while its lock is held.
    ///
    /// No transition of the group can interleave with `f`.
    pub fn group_with<R>(&self, name: &str, f: impl FnOnce(&GroupSnapshot) -> R) -> Option<R> {
        let entry = self.entry(name).ok()?;
        let entry = entry.lock().expect("group lock");
        Some(f(&entry.snapshot()))
    }

    /// Snapshots of all groups, ordered by name.
    pub fn groups(&self) -> Vec<GroupSnapshot> {
        let mut snapshots: Vec<GroupSnapshot> = self
            .entries()
            .into_iter()
            .map(|e| e.lock().expect("group lock").snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        snapshots
    }

    pub fn group_names(&self) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = self
            .inner
            .groups
            .read()
            .expect("groups lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Set the desired instance count, clamped to the policy bounds.
    pub fn set_desired(&self, name: &str, desired: u32) -> RegistryResult<u32> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().expect("group lock");
        let clamped = entry.spec.policy.clamp(desired);
        if clamped != entry.desired {
            debug!(group = %name, from = entry.desired, to = clamped, "desired count updated");
        }
        entry.desired = clamped;
        Ok(clamped)
    }

    pub fn set_paused(&self, name: &str, paused: bool) -> RegistryResult<()> {
        let entry = self.entry(name)?;
        entry.lock().expect("group lock").paused = paused;
        info!(group = %name, paused, "group scaling pause toggled");
        Ok(())
    }

    pub fn push_alert(
        &self,
        name: &str,
        instance: Option<&str>,
        message: impl Into<String>,
    ) -> RegistryResult<()> {
        let entry = self.entry(name)?;
        let message = message.into();
        warn!(group = %name, instance = ?instance, %message, "group alert");
        entry.lock().expect("group lock").push_alert(GroupAlert {
            at_ms: epoch_millis(),
            instance: instance.map(str::to_string),
            message,
        });
        Ok(())
    }

    // ── Instances ─────────────────────────────────────────────────

    pub fn instance(&self, id: &str) -> Option<InstanceSnapshot> {
        self.with_instance(id, |r| r.view.clone()).ok()
    }

    /// Name of the group owning `id`.
    pub fn group_of(&self, id: &str) -> Option<GroupName> {
        self.inner
            .index
            .read()
            .expect("index lock")
            .get(id)
            .cloned()
    }

    /// True if `id` belonged to an instance that has since terminated.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.inner
            .tombstones
            .lock()
            .expect("tombstones lock")
            .contains(id)
    }

    /// Create a new instance in PROVISIONING and reserve its host port.
    pub fn add_instance(&self, name: &str) -> RegistryResult<InstanceId> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().expect("group lock");

        let id = format!("{}-{}", entry.spec.name, entry.next_seq);
        let range = entry.spec.template.port_range;
        let port = self
            .inner
            .ports
            .lock()
            .expect("ports lock")
            .allocate(range, &id)
            .ok_or_else(|| RegistryError::PortExhausted {
                group: name.to_string(),
                start: range.start,
                end: range.end,
            })?;

        entry.next_seq += 1;
        let now = epoch_millis();
        let view = InstanceSnapshot {
            id: id.clone(),
            group: entry.spec.name.clone(),
            platform: entry.spec.platform,
            state: InstanceState::Provisioning,
            container_id: None,
            address: entry.spec.template.host_address.clone(),
            port,
            player_count: 0,
            load_metric: 0.0,
            last_heartbeat: None,
            last_seen_ms: now,
            state_since_ms: now,
            created_at_ms: now,
            last_error: None,
            adopted: false,
        };
        entry.instances.push(InstanceRecord {
            view,
            pending_reason: None,
        });
        self.inner
            .index
            .write()
            .expect("index lock")
            .insert(id.clone(), name.to_string());

        debug!(group = %name, instance = %id, port, "instance registered");
        Ok(id)
    }

    /// Register a running container found during reconciliation.
    ///
    /// The instance starts in PROVISIONING with `adopted` set; the caller
    /// applies `RuntimeStarted` once it has confirmed the container runs.
    /// The label id is kept when it is well formed and unused.
    pub fn adopt_instance(
        &self,
        name: &str,
        label_id: Option<&str>,
        container_id: &str,
        port: u16,
    ) -> RegistryResult<InstanceId> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().expect("group lock");

        let reusable = label_id
            .filter(|id| entry.seq_of(id).is_some())
            .filter(|id| entry.position(id).is_none() && !self.is_tombstoned(id));
        let id = match reusable {
            Some(id) => id.to_string(),
            None => format!("{}-{}", entry.spec.name, entry.next_seq),
        };

        let range = entry.spec.template.port_range;
        if !self.inner.ports.lock().expect("ports lock").claim(port, &id) {
            return Err(RegistryError::PortExhausted {
                group: name.to_string(),
                start: range.start,
                end: range.end,
            });
        }

        let seq = entry.seq_of(&id).unwrap_or(entry.next_seq);
        entry.next_seq = entry.next_seq.max(seq + 1);

        let now = epoch_millis();
        let view = InstanceSnapshot {
            id: id.clone(),
            group: entry.spec.name.clone(),
            platform: entry.spec.platform,
            state: InstanceState::Provisioning,
            container_id: Some(container_id.to_string()),
            address: entry.spec.template.host_address.clone(),
            port,
            player_count: 0,
            load_metric: 0.0,
            last_heartbeat: None,
            last_seen_ms: now,
            state_since_ms: now,
            created_at_ms: now,
            last_error: None,
            adopted: true,
        };
        entry.instances.push(InstanceRecord {
            view,
            pending_reason: None,
        });
        self.inner
            .index
            .write()
            .expect("index lock")
            .insert(id.clone(), name.to_string());

        info!(group = %name, instance = %id, %container_id, port, "instance adopted");
        Ok(id)
    }

    /// Forcibly drop an instance record, bypassing the state machine.
    ///
    /// Listeners are notified if the instance was ONLINE so that routing
    /// tables never keep a dangling entry.
    pub fn remove_instance(&self, id: &str) -> RegistryResult<InstanceSnapshot> {
        let name = self
            .group_of(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        let entry = self.entry(&name)?;
        let mut entry = entry.lock().expect("group lock");
        let idx = entry
            .position(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;

        let record = entry.instances.remove(idx);
        let from = record.view.state;
        let mut view = record.view;
        view.state = InstanceState::Terminated;
        let reason = record.pending_reason.unwrap_or(TerminationReason::Manual);
        self.retire(&mut entry, &view, reason);

        if from == InstanceState::Online {
            self.notify(&TransitionRecord {
                group: name.clone(),
                instance: view.clone(),
                from,
                to: InstanceState::Terminated,
            });
        }
        info!(group = %name, instance = %id, ?from, ?reason, "instance removed");
        Ok(view)
    }

    /// Apply a transition event, stamped with the current time.
    pub fn apply_transition(
        &self,
        id: &str,
        event: TransitionEvent,
    ) -> RegistryResult<TransitionOutcome> {
        self.apply_transition_at(id, event, epoch_millis())
    }

    /// Apply a transition event and record why the instance is going away.
    ///
    /// The reason is stored before the event is applied and used when the
    /// instance reaches TERMINATED.
    pub fn apply_transition_with_reason(
        &self,
        id: &str,
        event: TransitionEvent,
        reason: TerminationReason,
    ) -> RegistryResult<TransitionOutcome> {
        self.locate(id, |registry, name, entry, idx| {
            entry.instances[idx].pending_reason = Some(reason);
            registry.transition_locked(name, entry, idx, event, epoch_millis())
        })
    }

    /// Apply a transition event as if it happened at `now_ms`.
    pub fn apply_transition_at(
        &self,
        id: &str,
        event: TransitionEvent,
        now_ms: u64,
    ) -> RegistryResult<TransitionOutcome> {
        self.locate(id, |registry, name, entry, idx| {
            registry.transition_locked(name, entry, idx, event, now_ms)
        })
    }

    /// Apply `event` only if `due` still holds for the instance.
    ///
    /// `due` runs under the group lock, so no heartbeat or transition can
    /// land between the check and the transition. Returns `Ok(None)` when
    /// the check fails.
    pub fn apply_transition_if(
        &self,
        id: &str,
        event: TransitionEvent,
        reason: Option<TerminationReason>,
        now_ms: u64,
        due: impl FnOnce(&InstanceSnapshot) -> bool,
    ) -> RegistryResult<Option<TransitionOutcome>> {
        self.locate_or(id, Some(TransitionOutcome::Stale), |registry, name, entry, idx| {
            if !due(&entry.instances[idx].view) {
                return Ok(None);
            }
            if let Some(reason) = reason {
                entry.instances[idx].pending_reason = Some(reason);
            }
            registry
                .transition_locked(name, entry, idx, event, now_ms)
                .map(Some)
        })
    }

    /// Remember why an instance will be terminated without moving it.
    pub fn set_termination_reason(&self, id: &str, reason: TerminationReason) -> RegistryResult<()> {
        self.with_instance_mut(id, |r| r.pending_reason = Some(reason))
    }

    pub fn attach_container(&self, id: &str, container_id: &str) -> RegistryResult<()> {
        self.with_instance_mut(id, |r| r.view.container_id = Some(container_id.to_string()))
    }

    pub fn record_error(&self, id: &str, message: impl Into<String>) -> RegistryResult<()> {
        let message = message.into();
        self.with_instance_mut(id, |r| r.view.last_error = Some(message))
    }

    /// Store heartbeat metrics if `timestamp` is newer than the last one.
    pub fn record_heartbeat(
        &self,
        id: &str,
        timestamp: u64,
        metrics: HeartbeatMetrics,
        now_ms: u64,
    ) -> RegistryResult<HeartbeatRecord> {
        let result = self.with_instance_mut(id, |r| {
            if let Some(last) = r.view.last_heartbeat
                && timestamp <= last
            {
                return HeartbeatRecord::Dropped { last };
            }
            r.view.last_heartbeat = Some(timestamp);
            r.view.last_seen_ms = now_ms;
            r.view.player_count = metrics.player_count;
            r.view.load_metric = metrics.load_metric;
            HeartbeatRecord::Accepted(r.view.state)
        });
        match result {
            Err(RegistryError::InstanceNotFound(_)) if self.is_tombstoned(id) => {
                Ok(HeartbeatRecord::Stale)
            }
            other => other,
        }
    }

    // ── Internals ─────────────────────────────────────────────────

    fn entry(&self, name: &str) -> RegistryResult<Arc<Mutex<GroupEntry>>> {
        self.inner
            .groups
            .read()
            .expect("groups lock")
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))
    }

    fn entries(&self) -> Vec<Arc<Mutex<GroupEntry>>> {
        self.inner
            .groups
            .read()
            .expect("groups lock")
            .values()
            .cloned()
            .collect()
    }

    fn with_instance<R>(&self, id: &str, f: impl FnOnce(&InstanceRecord) -> R) -> RegistryResult<R> {
        let name = self
            .group_of(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        let entry = self.entry(&name)?;
        let entry = entry.lock().expect("group lock");
        let idx = entry
            .position(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        Ok(f(&entry.instances[idx]))
    }

    fn with_instance_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut InstanceRecord) -> R,
    ) -> RegistryResult<R> {
        let name = self
            .group_of(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        let entry = self.entry(&name)?;
        let mut entry = entry.lock().expect("group lock");
        let idx = entry
            .position(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        Ok(f(&mut entry.instances[idx]))
    }

    /// Lock the owning group of `id` and run `f`. Events for ids that have
    /// already terminated resolve to [`TransitionOutcome::Stale`].
    fn locate(
        &self,
        id: &str,
        f: impl FnOnce(&Self, &str, &mut GroupEntry, usize) -> RegistryResult<TransitionOutcome>,
    ) -> RegistryResult<TransitionOutcome> {
        self.locate_or(id, TransitionOutcome::Stale, f)
    }

    fn locate_or<R>(
        &self,
        id: &str,
        stale: R,
        f: impl FnOnce(&Self, &str, &mut GroupEntry, usize) -> RegistryResult<R>,
    ) -> RegistryResult<R> {
        let located = self
            .group_of(id)
            .and_then(|name| self.entry(&name).ok().map(|e| (name, e)));
        if let Some((name, entry)) = located {
            let mut entry = entry.lock().expect("group lock");
            if let Some(idx) = entry.position(id) {
                return f(self, &name, &mut entry, idx);
            }
        }
        if self.is_tombstoned(id) {
            warn!(instance = %id, "event for terminated instance ignored");
            return Ok(stale);
        }
        Err(RegistryError::InstanceNotFound(id.to_string()))
    }

    fn transition_locked(
        &self,
        name: &str,
        entry: &mut GroupEntry,
        idx: usize,
        event: TransitionEvent,
        now_ms: u64,
    ) -> RegistryResult<TransitionOutcome> {
        let from = entry.instances[idx].view.state;
        let to = from
            .next(event)
            .ok_or_else(|| RegistryError::InvalidTransition {
                instance: entry.instances[idx].view.id.clone(),
                from,
                event,
            })?;

        let view = {
            let record = &mut entry.instances[idx];
            record.view.state = to;
            record.view.state_since_ms = now_ms;
            // Entering a live state counts as contact.
            if matches!(to, InstanceState::Starting | InstanceState::Online) {
                record.view.last_seen_ms = now_ms;
            }
            record.view.clone()
        };

        if to.is_terminal() {
            let record = entry.instances.remove(idx);
            let reason = record.pending_reason.unwrap_or(if from == InstanceState::Provisioning {
                TerminationReason::ProvisionFailed
            } else {
                TerminationReason::Manual
            });
            self.retire(entry, &view, reason);
            info!(group = %name, instance = %view.id, ?reason, "instance terminated");
        } else {
            info!(group = %name, instance = %view.id, %from, %to, ?event, "instance transition");
        }

        self.notify(&TransitionRecord {
            group: name.to_string(),
            instance: view,
            from,
            to,
        });
        Ok(TransitionOutcome::Applied { from, to })
    }

    /// Release everything a departed instance held. Caller holds the group lock.
    fn retire(&self, entry: &mut GroupEntry, view: &InstanceSnapshot, reason: TerminationReason) {
        self.inner
            .ports
            .lock()
            .expect("ports lock")
            .release(view.port, &view.id);
        self.inner.index.write().expect("index lock").remove(&view.id);
        self.inner
            .tombstones
            .lock()
            .expect("tombstones lock")
            .insert(view.id.clone());
        entry.push_termination(TerminatedInstance {
            id: view.id.clone(),
            reason,
            at_ms: epoch_millis(),
            last_error: view.last_error.clone(),
        });
    }

    fn notify(&self, record: &TransitionRecord) {
        let listeners = self.inner.listeners.read().expect("listeners lock");
        for listener in listeners.iter() {
            listener.on_transition(record);
        }
    }
}
