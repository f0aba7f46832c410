use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use fleetgrid_protocol::{Packet, RouteEntry, RoutingUpdate};
use fleetgrid_state::{GroupName, GroupSnapshot, InstanceSnapshot, TransitionListener, TransitionRecord};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Outbound queue of a subscribed proxy.
///
/// `push` must not block. Returning `false` means the proxy cannot keep
/// up or is gone, and it is unsubscribed.
pub trait UpdateSink: Send + Sync {
    fn push(&self, packet: Packet) -> bool;
}

impl UpdateSink for mpsc::Sender<Packet> {
    fn push(&self, packet: Packet) -> bool {
        self.try_send(packet).is_ok()
    }
}

struct Subscriber {
    groups: BTreeSet<GroupName>,
    sink: Arc<dyn UpdateSink>,
}

/// Pushes routing updates to subscribed proxies.
pub struct RoutingPublisher {
    registry: fleetgrid_state::Registry,
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
}

impl RoutingPublisher {
    pub fn new(registry: fleetgrid_state::Registry) -> Arc<Self> {
        let publisher = Arc::new(Self {
            registry: registry.clone(),
            subscribers: RwLock::new(HashMap::new()),
        });
        registry.add_listener(publisher.clone());
        publisher
    }

    /// Subscribe a proxy connection to `groups`.
    ///
    /// Each group's full snapshot is queued while its lock is held, so no
    /// incremental update can be missed or arrive before the snapshot.
    /// Subscribing again adds to the existing set.
    pub fn subscribe(&self, conn: ConnectionId, groups: &[GroupName], sink: Arc<dyn UpdateSink>) {
        self.subscribers
            .write()
            .expect("subscribers lock")
            .entry(conn)
            .and_modify(|s| s.sink = sink.clone())
            .or_insert_with(|| Subscriber {
                groups: BTreeSet::new(),
                sink,
            });

        for name in groups {
            let sent = self.registry.group_with(name, |group| {
                let mut subscribers = self.subscribers.write().expect("subscribers lock");
                let Some(sub) = subscribers.get_mut(&conn) else {
                    return false;
                };
                sub.groups.insert(name.clone());
                sub.sink.push(full_update(group))
            });

            match sent {
                Some(true) => debug!(conn, group = %name, "routing snapshot queued"),
                Some(false) => {
                    warn!(conn, group = %name, "proxy queue full, dropping subscriber");
                    self.unsubscribe(conn);
                    return;
                }
                None => {
                    // Updates start flowing once the group is created.
                    debug!(conn, group = %name, "subscribed to unknown group");
                    if let Some(sub) = self
                        .subscribers
                        .write()
                        .expect("subscribers lock")
                        .get_mut(&conn)
                    {
                        sub.groups.insert(name.clone());
                    }
                }
            }
        }
        info!(conn, groups = ?groups, "proxy subscribed");
    }

    pub fn unsubscribe(&self, conn: ConnectionId) -> bool {
        let removed = self
            .subscribers
            .write()
            .expect("subscribers lock")
            .remove(&conn)
            .is_some();
        if removed {
            debug!(conn, "proxy unsubscribed");
        }
        removed
    }

    /// Groups `conn` is subscribed to.
    pub fn subscriptions(&self, conn: ConnectionId) -> Option<Vec<GroupName>> {
        self.subscribers
            .read()
            .expect("subscribers lock")
            .get(&conn)
            .map(|s| s.groups.iter().cloned().collect())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("subscribers lock").len()
    }

    fn publish(&self, group: &str, update: Packet) {
        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read().expect("subscribers lock");
            for (conn, sub) in subscribers.iter() {
                if sub.groups.contains(group) && !sub.sink.push(update.clone()) {
                    dropped.push(*conn);
                }
            }
        }
        for conn in dropped {
            warn!(conn, %group, "proxy queue full, dropping subscriber");
            self.unsubscribe(conn);
        }
    }
}

impl TransitionListener for RoutingPublisher {
    fn on_transition(&self, record: &TransitionRecord) {
        let entry = if record.entered_online() {
            route_entry(&record.instance)
        } else if record.left_online() {
            RouteEntry::removal(&record.instance.id)
        } else {
            return;
        };
        debug!(
            group = %record.group,
            instance = %record.instance.id,
            removal = entry.is_removal(),
            "routing update"
        );
        self.publish(
            &record.group,
            Packet::RoutingUpdate(RoutingUpdate {
                group_name: record.group.clone(),
                full: false,
                entries: vec![entry],
            }),
        );
    }
}

fn route_entry(instance: &InstanceSnapshot) -> RouteEntry {
    RouteEntry {
        instance_id: instance.id.clone(),
        address: instance.address.clone(),
        port: instance.port,
    }
}

fn full_update(group: &GroupSnapshot) -> Packet {
    Packet::RoutingUpdate(RoutingUpdate {
        group_name: group.name().to_string(),
        full: true,
        entries: group.online().map(route_entry).collect(),
    })
}
