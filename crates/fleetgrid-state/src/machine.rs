//! Instance lifecycle state machine.
//!
//! ```text
//! PROVISIONING --runtime-started--> STARTING
//! PROVISIONING --runtime-error----> TERMINATED
//! STARTING     --heartbeat-ok-----> ONLINE
//! STARTING     --timeout----------> UNRESPONSIVE
//! ONLINE       --drain-requested--> DRAINING
//! ONLINE       --heartbeat-missed-> UNRESPONSIVE
//! DRAINING     --drained----------> STOPPING
//! UNRESPONSIVE --heartbeat-ok-----> ONLINE
//! UNRESPONSIVE --reclaim-timeout--> STOPPING
//! STOPPING     --runtime-removed--> TERMINATED
//! ```
//!
//! Any pair not listed is rejected. TERMINATED has no outgoing edges.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Starting,
    Online,
    Draining,
    Unresponsive,
    Stopping,
    Terminated,
}

/// Events that drive [`InstanceState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    RuntimeStarted,
    RuntimeError,
    HeartbeatOk,
    Timeout,
    DrainRequested,
    HeartbeatMissed,
    Drained,
    ReclaimTimeout,
    RuntimeRemoved,
}

impl InstanceState {
    /// Resulting state for `event`, or `None` if the table has no such edge.
    pub fn next(self, event: TransitionEvent) -> Option<InstanceState> {
        use InstanceState::*;
        use TransitionEvent::*;

        match (self, event) {
            (Provisioning, RuntimeStarted) => Some(Starting),
            (Provisioning, RuntimeError) => Some(Terminated),
            (Starting, HeartbeatOk) => Some(Online),
            (Starting, Timeout) => Some(Unresponsive),
            (Online, DrainRequested) => Some(Draining),
            (Online, HeartbeatMissed) => Some(Unresponsive),
            (Draining, Drained) => Some(Stopping),
            (Unresponsive, HeartbeatOk) => Some(Online),
            (Unresponsive, ReclaimTimeout) => Some(Stopping),
            (Stopping, RuntimeRemoved) => Some(Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == InstanceState::Terminated
    }

    /// Only ONLINE instances may appear in a routing table.
    pub fn is_routable(self) -> bool {
        self == InstanceState::Online
    }

    /// Instances on their way out: they no longer count toward group size
    /// for scaling purposes.
    pub fn is_leaving(self) -> bool {
        matches!(
            self,
            InstanceState::Draining | InstanceState::Stopping | InstanceState::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Starting => "starting",
            InstanceState::Online => "online",
            InstanceState::Draining => "draining",
            InstanceState::Unresponsive => "unresponsive",
            InstanceState::Stopping => "stopping",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;
    use TransitionEvent::*;

    const ALL_STATES: [InstanceState; 7] = [
        Provisioning,
        Starting,
        Online,
        Draining,
        Unresponsive,
        Stopping,
        Terminated,
    ];

    const ALL_EVENTS: [TransitionEvent; 9] = [
        RuntimeStarted,
        RuntimeError,
        HeartbeatOk,
        Timeout,
        DrainRequested,
        HeartbeatMissed,
        Drained,
        ReclaimTimeout,
        RuntimeRemoved,
    ];

    #[test]
    fn table_has_exactly_ten_edges() {
        let edges = ALL_STATES
            .iter()
            .flat_map(|s| ALL_EVENTS.iter().map(move |e| (*s, *e)))
            .filter(|(s, e)| s.next(*e).is_some())
            .count();
        assert_eq!(edges, 10);
    }

    #[test]
    fn terminated_has_no_outgoing_edges() {
        for event in ALL_EVENTS {
            assert_eq!(Terminated.next(event), None);
        }
    }

    #[test]
    fn happy_path_to_online_and_out() {
        let mut state = Provisioning;
        for (event, expected) in [
            (RuntimeStarted, Starting),
            (HeartbeatOk, Online),
            (DrainRequested, Draining),
            (Drained, Stopping),
            (RuntimeRemoved, Terminated),
        ] {
            state = state.next(event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn unresponsive_recovers_or_is_reclaimed() {
        assert_eq!(Online.next(HeartbeatMissed), Some(Unresponsive));
        assert_eq!(Unresponsive.next(HeartbeatOk), Some(Online));
        assert_eq!(Unresponsive.next(ReclaimTimeout), Some(Stopping));
        assert_eq!(Starting.next(Timeout), Some(Unresponsive));
    }

    #[test]
    fn provisioning_failure_is_terminal() {
        assert_eq!(Provisioning.next(RuntimeError), Some(Terminated));
    }

    #[test]
    fn undefined_edges_are_rejected() {
        assert_eq!(Starting.next(DrainRequested), None);
        assert_eq!(Online.next(RuntimeRemoved), None);
        assert_eq!(Draining.next(HeartbeatOk), None);
        assert_eq!(Provisioning.next(HeartbeatOk), None);
    }

    #[test]
    fn only_online_is_routable() {
        for state in ALL_STATES {
            assert_eq!(state.is_routable(), state == Online);
        }
    }
}
