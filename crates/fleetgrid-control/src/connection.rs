//! Connection table and per-connection outbound queues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fleetgrid_lifecycle::AgentChannel;
use fleetgrid_protocol::Packet;
use fleetgrid_routing::{ConnectionId, UpdateSink};
use fleetgrid_state::{GroupName, InstanceId};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// Sending side of one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub protocol_version: u16,
    tx: mpsc::Sender<Packet>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    /// Queue a packet without waiting.
    ///
    /// A full queue means the peer is not reading; the connection is
    /// closed and `false` returned.
    pub fn send(&self, packet: Packet) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(p)) => {
                warn!(conn = self.id, peer = %self.peer, packet = p.name(), "outbound queue full, closing slow connection");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection's reader loop to stop.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.closed.notified().await;
    }
}

impl UpdateSink for ConnectionHandle {
    fn push(&self, packet: Packet) -> bool {
        self.send(packet)
    }
}

/// A connection subscribed to routing updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub protocol_version: u16,
    pub groups: Vec<GroupName>,
}

/// All live connections and the instance → connection bindings used for
/// agent commands.
#[derive(Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    bindings: RwLock<HashMap<InstanceId, ConnectionId>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection that completed its handshake.
    pub fn insert(
        &self,
        peer: SocketAddr,
        protocol_version: u16,
        tx: mpsc::Sender<Packet>,
    ) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ConnectionHandle {
            id,
            peer,
            protocol_version,
            tx,
            closed: Arc::new(Notify::new()),
        };
        self.connections
            .write()
            .expect("connections lock")
            .insert(id, handle.clone());
        handle
    }

    /// Drop a connection and every instance bound to it.
    pub fn remove(&self, id: ConnectionId) {
        self.connections.write().expect("connections lock").remove(&id);
        self.bindings
            .write()
            .expect("bindings lock")
            .retain(|_, conn| *conn != id);
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().expect("connections lock").get(&id).cloned()
    }

    /// Live connections ordered by id.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self
            .connections
            .read()
            .expect("connections lock")
            .values()
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("connections lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind `instance` to `conn` unless another live connection holds it.
    ///
    /// Returns `true` if `conn` now owns the instance.
    pub fn claim(&self, instance: &str, conn: ConnectionId) -> bool {
        let connections = self.connections.read().expect("connections lock");
        let mut bindings = self.bindings.write().expect("bindings lock");
        match bindings.get(instance) {
            Some(owner) if *owner == conn => true,
            Some(owner) if connections.contains_key(owner) => false,
            _ => {
                bindings.insert(instance.to_string(), conn);
                true
            }
        }
    }

    /// Connection bound to `instance`.
    pub fn bound(&self, instance: &str) -> Option<ConnectionHandle> {
        let conn = *self.bindings.read().expect("bindings lock").get(instance)?;
        self.get(conn)
    }

    fn send_to(&self, instance: &str, packet: Packet) -> bool {
        match self.bound(instance) {
            Some(handle) => handle.send(packet),
            None => {
                debug!(%instance, packet = packet.name(), "no agent bound to instance");
                false
            }
        }
    }
}

impl AgentChannel for ConnectionTable {
    fn send_drain(&self, instance_id: &str, grace: Duration) -> bool {
        self.send_to(
            instance_id,
            Packet::DrainCommand {
                instance_id: instance_id.to_string(),
                grace_millis: grace.as_millis() as u64,
            },
        )
    }

    fn send_shutdown(&self, instance_id: &str) -> bool {
        self.send_to(
            instance_id,
            Packet::ShutdownCommand {
                instance_id: instance_id.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn drain_goes_to_bound_connection() {
        let table = ConnectionTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = table.insert(peer(), 1, tx);
        assert!(table.claim("lobby-1", handle.id));

        assert!(table.send_drain("lobby-1", Duration::from_secs(30)));
        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::DrainCommand {
                instance_id: "lobby-1".to_string(),
                grace_millis: 30_000,
            }
        );
        assert!(!table.send_shutdown("lobby-2"));
    }

    #[test]
    fn removing_connection_drops_bindings() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = table.insert(peer(), 1, tx);
        assert!(table.claim("lobby-1", handle.id));

        table.remove(handle.id);
        assert!(table.is_empty());
        assert!(table.bound("lobby-1").is_none());
        assert!(!table.send_shutdown("lobby-1"));
    }

    #[test]
    fn claim_refuses_instances_of_other_live_connections() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let owner = table.insert(peer(), 1, tx.clone());
        let other = table.insert(peer(), 1, tx);

        assert!(table.claim("lobby-1", owner.id));
        assert!(table.claim("lobby-1", owner.id));
        assert!(!table.claim("lobby-1", other.id));
        assert_eq!(table.bound("lobby-1").unwrap().id, owner.id);

        table.remove(owner.id);
        assert!(table.claim("lobby-1", other.id));
        assert_eq!(table.bound("lobby-1").unwrap().id, other.id);
    }

    #[test]
    fn connection_ids_are_unique() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = table.insert(peer(), 1, tx.clone());
        let b = table.insert(peer(), 1, tx);
        assert_ne!(a.id, b.id);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn full_queue_closes_connection() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = table.insert(peer(), 1, tx);

        let shutdown = Packet::ShutdownCommand {
            instance_id: "lobby-1".to_string(),
        };
        assert!(handle.send(shutdown.clone()));
        assert!(!handle.send(shutdown));

        // The close request is stored until the reader loop waits for it.
        tokio::time::timeout(Duration::from_millis(100), handle.closed())
            .await
            .unwrap();
    }
}
