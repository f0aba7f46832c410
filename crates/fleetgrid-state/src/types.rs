//! Domain types for fleetgrid.
//!
//! Group definitions (`GroupSpec`) are serializable and persisted by the
//! [`GroupStore`](crate::GroupStore). Snapshots are read-only copies handed
//! out by the [`Registry`](crate::Registry).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::machine::InstanceState;

/// Unique name of a server group.
pub type GroupName = String;

/// Unique identifier of a server instance (`{group}-{seq}`).
pub type InstanceId = String;

/// Label stamped on every container this system creates.
pub const MANAGED_LABEL: &str = "fleetgrid.managed";

/// Label carrying the owning group name.
pub const GROUP_LABEL: &str = "fleetgrid.group";

/// Label carrying the instance id.
pub const INSTANCE_LABEL: &str = "fleetgrid.instance";

/// Label carrying the allocated host port.
pub const PORT_LABEL: &str = "fleetgrid.port";

// ── Group ─────────────────────────────────────────────────────────

/// Supported game-server and proxy platforms.
///
/// Discriminants are wire ids and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Platform {
    Paper = 1,
    Spigot = 2,
    Minestom = 3,
    Velocity = 4,
    BungeeCord = 5,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Paper,
        Platform::Spigot,
        Platform::Minestom,
        Platform::Velocity,
        Platform::BungeeCord,
    ];

    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn from_wire_id(id: u8) -> Option<Platform> {
        Platform::ALL.into_iter().find(|p| p.wire_id() == id)
    }

    /// Lowercase name, as used in config files and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Paper => "paper",
            Platform::Spigot => "spigot",
            Platform::Minestom => "minestom",
            Platform::Velocity => "velocity",
            Platform::BungeeCord => "bungee_cord",
        }
    }

    pub fn from_name(name: &str) -> Option<Platform> {
        Platform::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// Proxies receive routing updates instead of serving players directly.
    pub fn is_proxy(self) -> bool {
        matches!(self, Platform::Velocity | Platform::BungeeCord)
    }
}

/// Inclusive host port range a group may allocate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Container template used to create each instance of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerTemplate {
    /// Image reference, e.g. `ghcr.io/acme/lobby:1.4`.
    pub image: String,
    /// Memory limit in bytes (0 = unlimited).
    #[serde(default)]
    pub memory_bytes: u64,
    /// CPU limit in millicores (0 = unlimited).
    #[serde(default)]
    pub cpu_millis: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    pub port_range: PortRange,
    /// Address proxies should use to reach instances of this group.
    #[serde(default = "default_host_address")]
    pub host_address: String,
}

fn default_host_address() -> String {
    "127.0.0.1".to_string()
}

/// How a group's demand signal is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Mean player count across ONLINE instances.
    #[default]
    PlayersPerInstance,
    /// Players divided by total player capacity (0.0–1.0).
    Utilization,
    /// Mean load metric reported by agents (queue depth, tick time, ...).
    LoadMetric,
}

/// Scaling policy of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPolicy {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Scale up when the demand signal reaches this value.
    pub scale_up_threshold: f64,
    /// Scale down when the demand signal drops to this value.
    pub scale_down_threshold: f64,
    /// Minimum time between two applied scaling decisions.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub signal: SignalKind,
    /// Player capacity of one instance, used by [`SignalKind::Utilization`].
    #[serde(default = "default_max_players")]
    pub max_players: u32,
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_players() -> u32 {
    20
}

impl GroupPolicy {
    /// Check the policy invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("max_instances must be at least 1".to_string());
        }
        if self.min_instances > self.max_instances {
            return Err(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }
        if self.signal == SignalKind::Utilization && self.max_players == 0 {
            return Err("utilization signal requires max_players > 0".to_string());
        }
        Ok(())
    }

    /// Clamp an instance count into `[min, max]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min_instances, self.max_instances)
    }
}

/// Persisted definition of a server group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: GroupName,
    pub platform: Platform,
    pub policy: GroupPolicy,
    pub template: ContainerTemplate,
}

impl GroupSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("group name must not be empty".to_string());
        }
        if self.template.port_range.is_empty() {
            return Err(format!(
                "port range {}-{} is empty",
                self.template.port_range.start, self.template.port_range.end
            ));
        }
        let span = self.template.port_range.len();
        if span < self.policy.max_instances as usize {
            return Err(format!(
                "port range holds {span} port(s) but max_instances is {}",
                self.policy.max_instances
            ));
        }
        self.policy.validate()
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Why an instance was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Runtime creation failed after all retry attempts.
    ProvisionFailed,
    /// Removed by a scale-down decision.
    ScaledDown,
    /// Heartbeats stopped and the instance was reclaimed.
    Reclaimed,
    /// The agent announced its own shutdown.
    Deregistered,
    /// Terminated through the management API.
    Manual,
    /// Found in the runtime but not owned by any known group.
    Orphaned,
}

/// Metrics carried by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub player_count: u32,
    pub load_metric: f64,
}

/// Read-only view of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub group: GroupName,
    pub platform: Platform,
    pub state: InstanceState,
    pub container_id: Option<String>,
    pub address: String,
    pub port: u16,
    pub player_count: u32,
    pub load_metric: f64,
    /// Agent-side timestamp of the newest accepted heartbeat.
    pub last_heartbeat: Option<u64>,
    /// Local time (epoch ms) the newest heartbeat was received.
    pub last_seen_ms: u64,
    /// Local time (epoch ms) the current state was entered.
    pub state_since_ms: u64,
    pub created_at_ms: u64,
    pub last_error: Option<String>,
    /// True if rebuilt from a running container during reconciliation.
    pub adopted: bool,
}

/// A group-level diagnostic (failed provisioning, exhausted ports, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAlert {
    pub at_ms: u64,
    pub instance: Option<InstanceId>,
    pub message: String,
}

/// Final record of a terminated instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatedInstance {
    pub id: InstanceId,
    pub reason: TerminationReason,
    pub at_ms: u64,
    pub last_error: Option<String>,
}

/// Read-only view of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub spec: GroupSpec,
    pub desired_count: u32,
    pub paused: bool,
    /// Instances in creation order.
    pub instances: Vec<InstanceSnapshot>,
    pub alerts: Vec<GroupAlert>,
    pub terminations: Vec<TerminatedInstance>,
}

impl GroupSnapshot {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Instances that count toward the group size (not draining or stopping).
    pub fn active_count(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| !i.state.is_leaving())
            .count() as u32
    }

    pub fn online(&self) -> impl Iterator<Item = &InstanceSnapshot> {
        self.instances.iter().filter(|i| i.state.is_routable())
    }

    /// True while a drain or stop is in progress in this group.
    pub fn draining(&self) -> bool {
        self.instances
            .iter()
            .any(|i| matches!(i.state, InstanceState::Draining | InstanceState::Stopping))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
