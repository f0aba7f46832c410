//! Control server — accept loop, handshake, and packet dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleetgrid_health::{HealthMonitor, HeartbeatOutcome};
use fleetgrid_lifecycle::LifecycleController;
use fleetgrid_protocol::{PROTOCOL_VERSION, Packet, ProtocolError, read_packet, write_packet};
use fleetgrid_routing::RoutingPublisher;
use fleetgrid_state::{
    HeartbeatMetrics, InstanceState, Platform, Registry, RegistryError, TransitionEvent,
    TransitionOutcome,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionTable, ProxyConnection};

#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// Shared secret agents must present. `None` accepts any handshake.
    pub token: Option<String>,
    pub handshake_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            token: None,
            handshake_timeout: Duration::from_secs(5),
            outbound_queue: 256,
        }
    }
}

/// Why a handshake was refused.
enum Refusal {
    VersionMismatch(u16),
    BadToken,
}

impl Refusal {
    fn reason(&self) -> &'static str {
        match self {
            Refusal::VersionMismatch(_) => "protocol version mismatch",
            Refusal::BadToken => "authentication failed",
        }
    }
}

pub struct ControlServer {
    registry: Registry,
    health: Arc<HealthMonitor>,
    lifecycle: LifecycleController,
    routing: Arc<RoutingPublisher>,
    connections: Arc<ConnectionTable>,
    settings: ControlSettings,
}

impl ControlServer {
    pub fn new(
        health: Arc<HealthMonitor>,
        lifecycle: LifecycleController,
        routing: Arc<RoutingPublisher>,
        settings: ControlSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: lifecycle.registry().clone(),
            health,
            lifecycle,
            routing,
            connections: Arc::new(ConnectionTable::new()),
            settings,
        })
    }

    /// The connection table; also the lifecycle controller's agent channel.
    pub fn connections(&self) -> Arc<ConnectionTable> {
        self.connections.clone()
    }

    /// Connections currently subscribed to routing updates.
    pub fn proxy_connections(&self) -> Vec<ProxyConnection> {
        self.connections
            .handles()
            .into_iter()
            .filter_map(|conn| {
                let groups = self.routing.subscriptions(conn.id)?;
                Some(ProxyConnection {
                    id: conn.id,
                    peer: conn.peer,
                    protocol_version: conn.protocol_version,
                    groups,
                })
            })
            .collect()
    }

    /// Accept connections until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;
        info!(%addr, "control server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer, shutdown).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("control server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        let version = match self.handshake(&mut reader, &mut writer, peer).await {
            Some(version) => version,
            None => return,
        };

        let (tx, mut rx) = mpsc::channel::<Packet>(self.settings.outbound_queue.max(1));
        let conn = self.connections.insert(peer, version, tx);
        info!(conn = conn.id, %peer, "agent connected");

        let writer_conn = conn.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    debug!(conn = writer_conn.id, error = %e, "write failed");
                    writer_conn.close();
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                read = read_packet(&mut reader) => match read {
                    Ok(Some(packet)) => self.dispatch(&conn, packet),
                    Ok(None) => {
                        debug!(conn = conn.id, "peer closed connection");
                        break;
                    }
                    Err(ProtocolError::Io(e)) => {
                        debug!(conn = conn.id, error = %e, "connection read failed");
                        break;
                    }
                    Err(e) => {
                        warn!(conn = conn.id, %peer, error = %e, "malformed frame, closing connection");
                        break;
                    }
                },
                _ = conn.closed() => break,
                _ = shutdown.changed() => break,
            }
        }

        self.routing.unsubscribe(conn.id);
        self.connections.remove(conn.id);
        drop(conn);
        writer_task.abort();
        info!(%peer, "agent disconnected");
    }

    /// Read and answer the handshake. Returns the accepted protocol version.
    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W, peer: SocketAddr) -> Option<u16>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let first = tokio::time::timeout(self.settings.handshake_timeout, read_packet(reader)).await;
        let (protocol_version, token) = match first {
            Ok(Ok(Some(Packet::Handshake {
                protocol_version,
                token,
            }))) => (protocol_version, token),
            Ok(Ok(Some(other))) => {
                warn!(%peer, packet = other.name(), "expected handshake");
                return None;
            }
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "malformed handshake");
                return None;
            }
            Err(_) => {
                warn!(%peer, timeout = ?self.settings.handshake_timeout, "handshake timed out");
                return None;
            }
        };

        let refusal = if protocol_version != PROTOCOL_VERSION {
            Some(Refusal::VersionMismatch(protocol_version))
        } else if let Some(expected) = &self.settings.token
            && token.as_deref() != Some(expected.as_str())
        {
            Some(Refusal::BadToken)
        } else {
            None
        };

        let ack = Packet::HandshakeAck {
            accepted: refusal.is_none(),
            reason: refusal.as_ref().map(|r| r.reason().to_string()),
        };
        if let Err(e) = write_packet(writer, &ack).await {
            debug!(%peer, error = %e, "could not send handshake ack");
            return None;
        }

        match refusal {
            None => Some(protocol_version),
            Some(Refusal::VersionMismatch(v)) => {
                warn!(%peer, version = v, expected = PROTOCOL_VERSION, "protocol version mismatch");
                None
            }
            Some(Refusal::BadToken) => {
                warn!(%peer, "handshake authentication failed");
                None
            }
        }
    }

    fn dispatch(&self, conn: &ConnectionHandle, packet: Packet) {
        match packet {
            Packet::RegisterInstance {
                instance_id,
                platform,
                reported_port,
            } => self.register(conn, &instance_id, platform, reported_port),
            Packet::Heartbeat {
                instance_id,
                timestamp,
                player_count,
                load_metric,
            } => {
                if !self.owns(conn, &instance_id) {
                    return;
                }
                let metrics = HeartbeatMetrics {
                    player_count,
                    load_metric,
                };
                match self.health.on_heartbeat(&instance_id, metrics, timestamp) {
                    Ok(HeartbeatOutcome::Online { from }) => {
                        debug!(instance = %instance_id, %from, "instance online");
                    }
                    Ok(_) => {}
                    Err(RegistryError::InstanceNotFound(_)) => {
                        debug!(conn = conn.id, instance = %instance_id, "heartbeat for unknown instance");
                    }
                    Err(e) => warn!(instance = %instance_id, error = %e, "heartbeat rejected"),
                }
            }
            Packet::Deregister {
                instance_id,
                reason,
            } => {
                if self.owns(conn, &instance_id) {
                    self.lifecycle.handle_deregister(&instance_id, &reason);
                }
            }
            Packet::ProxySubscribe { group_names } => {
                self.routing
                    .subscribe(conn.id, &group_names, Arc::new(conn.clone()));
            }
            other => {
                warn!(conn = conn.id, packet = other.name(), "unexpected packet from agent, ignoring");
            }
        }
    }

    fn register(&self, conn: &ConnectionHandle, id: &str, platform: Platform, reported_port: u16) {
        let Some(instance) = self.registry.instance(id) else {
            if self.registry.is_tombstoned(id) {
                debug!(conn = conn.id, instance = %id, "register for terminated instance");
            } else {
                warn!(conn = conn.id, instance = %id, "register for unknown instance");
            }
            return;
        };

        if instance.platform != platform {
            warn!(
                conn = conn.id,
                instance = %id,
                expected = %instance.platform.as_str(),
                reported = %platform.as_str(),
                "platform mismatch, registration ignored"
            );
            return;
        }
        if instance.port != reported_port {
            warn!(instance = %id, allocated = instance.port, reported_port, "agent reports a different port");
        }
        if !self.owns(conn, id) {
            return;
        }
        info!(conn = conn.id, group = %instance.group, instance = %id, "instance registered");

        // Registration stands in for the runtime and heartbeat signals.
        let event = match instance.state {
            InstanceState::Provisioning => TransitionEvent::RuntimeStarted,
            InstanceState::Starting | InstanceState::Unresponsive => TransitionEvent::HeartbeatOk,
            _ => return,
        };
        match self.registry.apply_transition(id, event) {
            Ok(TransitionOutcome::Applied { from, to }) => {
                debug!(instance = %id, %from, %to, "registration advanced instance");
            }
            Ok(TransitionOutcome::Stale) => {}
            Err(e) => debug!(instance = %id, error = %e, "registration transition skipped"),
        }
    }

    /// Whether `conn` may speak for instance `id`, claiming it if unowned.
    ///
    /// Unknown and terminated ids pass; the handlers report those.
    fn owns(&self, conn: &ConnectionHandle, id: &str) -> bool {
        if self.registry.group_of(id).is_none() || self.connections.claim(id, conn.id) {
            return true;
        }
        warn!(conn = conn.id, instance = %id, "instance is bound to another connection, packet ignored");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_lifecycle::{AgentChannel, LifecycleSettings, MemoryRuntime};
    use fleetgrid_state::*;
    use std::collections::BTreeMap;

    struct Harness {
        registry: Registry,
        server: Arc<ControlServer>,
        addr: SocketAddr,
        _shutdown: watch::Sender<bool>,
    }

    fn spec(name: &str, platform: Platform, start: u16) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            platform,
            policy: GroupPolicy {
                min_instances: 0,
                max_instances: 3,
                scale_up_threshold: 20.0,
                scale_down_threshold: 5.0,
                cooldown_secs: 30,
                signal: SignalKind::PlayersPerInstance,
                max_players: 20,
            },
            template: ContainerTemplate {
                image: format!("{name}:latest"),
                memory_bytes: 0,
                cpu_millis: 0,
                env: BTreeMap::new(),
                command: None,
                port_range: PortRange {
                    start,
                    end: start + 9,
                },
                host_address: "127.0.0.1".to_string(),
            },
        }
    }

    async fn start(token: Option<&str>) -> Harness {
        let registry = Registry::new();
        registry
            .create_group(spec("lobby", Platform::Paper, 30000))
            .unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let lifecycle =
            LifecycleController::new(registry.clone(), runtime, LifecycleSettings::default());
        let health = Arc::new(HealthMonitor::new(registry.clone()));
        let routing = RoutingPublisher::new(registry.clone());
        let server = ControlServer::new(
            health,
            lifecycle.clone(),
            routing,
            ControlSettings {
                token: token.map(str::to_string),
                handshake_timeout: Duration::from_millis(200),
                outbound_queue: 16,
            },
        );
        lifecycle.set_agent_channel(server.connections());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().serve(listener, rx));

        Harness {
            registry,
            server,
            addr,
            _shutdown: tx,
        }
    }

    async fn connect(addr: SocketAddr, version: u16, token: Option<&str>) -> (TcpStream, Packet) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_packet(
            &mut stream,
            &Packet::Handshake {
                protocol_version: version,
                token: token.map(str::to_string),
            },
        )
        .await
        .unwrap();
        let ack = read_packet(&mut stream).await.unwrap().unwrap();
        (stream, ack)
    }

    async fn next(stream: &mut TcpStream) -> Option<Packet> {
        tokio::time::timeout(Duration::from_secs(2), read_packet(stream))
            .await
            .expect("read timed out")
            .unwrap_or(None)
    }

    fn starting_instance(registry: &Registry) -> InstanceId {
        let id = registry.add_instance("lobby").unwrap();
        registry
            .apply_transition(&id, TransitionEvent::RuntimeStarted)
            .unwrap();
        id
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn handshake_accepted() {
        let h = start(None).await;
        let (_stream, ack) = connect(h.addr, PROTOCOL_VERSION, None).await;
        assert_eq!(
            ack,
            Packet::HandshakeAck {
                accepted: true,
                reason: None
            }
        );
    }

    #[tokio::test]
    async fn version_mismatch_is_refused_and_closed() {
        let h = start(None).await;
        let (mut stream, ack) = connect(h.addr, PROTOCOL_VERSION + 1, None).await;
        assert_eq!(
            ack,
            Packet::HandshakeAck {
                accepted: false,
                reason: Some("protocol version mismatch".to_string())
            }
        );
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn wrong_token_is_refused() {
        let h = start(Some("s3cret")).await;
        let (_s, ack) = connect(h.addr, PROTOCOL_VERSION, Some("guess")).await;
        assert_eq!(
            ack,
            Packet::HandshakeAck {
                accepted: false,
                reason: Some("authentication failed".to_string())
            }
        );
        let (_s, ack) = connect(h.addr, PROTOCOL_VERSION, Some("s3cret")).await;
        assert!(matches!(ack, Packet::HandshakeAck { accepted: true, .. }));
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let h = start(None).await;
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn heartbeat_brings_instance_online() {
        let h = start(None).await;
        let id = starting_instance(&h.registry);
        let (mut stream, _) = connect(h.addr, PROTOCOL_VERSION, None).await;

        write_packet(
            &mut stream,
            &Packet::RegisterInstance {
                instance_id: id.clone(),
                platform: Platform::Paper,
                reported_port: 30000,
            },
        )
        .await
        .unwrap();
        write_packet(
            &mut stream,
            &Packet::Heartbeat {
                instance_id: id.clone(),
                timestamp: 1,
                player_count: 4,
                load_metric: 0.5,
            },
        )
        .await
        .unwrap();

        let registry = h.registry.clone();
        assert!(
            eventually(|| registry
                .instance(&id)
                .is_some_and(|i| i.state == InstanceState::Online))
            .await
        );
        assert_eq!(h.registry.instance(&id).unwrap().player_count, 4);

        // Registration bound this connection as the command channel.
        assert!(h.server.connections().send_drain(&id, Duration::from_secs(5)));
        assert_eq!(
            next(&mut stream).await,
            Some(Packet::DrainCommand {
                instance_id: id.clone(),
                grace_millis: 5_000
            })
        );
    }

    async fn register(stream: &mut TcpStream, id: &str, port: u16) {
        write_packet(
            stream,
            &Packet::RegisterInstance {
                instance_id: id.to_string(),
                platform: Platform::Paper,
                reported_port: port,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn registration_advances_instance_state() {
        let h = start(None).await;
        let starting = starting_instance(&h.registry);
        let provisioning = h.registry.add_instance("lobby").unwrap();
        let (mut stream, _) = connect(h.addr, PROTOCOL_VERSION, None).await;

        register(&mut stream, &starting, 30000).await;
        register(&mut stream, &provisioning, 30001).await;

        let registry = h.registry.clone();
        assert!(
            eventually(|| registry
                .instance(&provisioning)
                .is_some_and(|i| i.state == InstanceState::Starting))
            .await
        );
        assert_eq!(
            h.registry.instance(&starting).unwrap().state,
            InstanceState::Online
        );
    }

    #[tokio::test]
    async fn registration_recovers_unresponsive_instance() {
        let h = start(None).await;
        let id = starting_instance(&h.registry);
        h.registry
            .apply_transition(&id, TransitionEvent::Timeout)
            .unwrap();
        let (mut stream, _) = connect(h.addr, PROTOCOL_VERSION, None).await;

        register(&mut stream, &id, 30000).await;
        let registry = h.registry.clone();
        assert!(
            eventually(|| registry
                .instance(&id)
                .is_some_and(|i| i.state == InstanceState::Online))
            .await
        );
    }

    #[tokio::test]
    async fn other_connections_cannot_speak_for_a_bound_instance() {
        let h = start(None).await;
        let id = starting_instance(&h.registry);
        let (mut owner, _) = connect(h.addr, PROTOCOL_VERSION, None).await;
        register(&mut owner, &id, 30000).await;
        let registry = h.registry.clone();
        assert!(
            eventually(|| registry
                .instance(&id)
                .is_some_and(|i| i.state == InstanceState::Online))
            .await
        );

        let (mut stranger, _) = connect(h.addr, PROTOCOL_VERSION, None).await;
        register(&mut stranger, &id, 30000).await;
        for packet in [
            Packet::Heartbeat {
                instance_id: id.clone(),
                timestamp: 50,
                player_count: 99,
                load_metric: 1.0,
            },
            Packet::Deregister {
                instance_id: id.clone(),
                reason: "not mine".to_string(),
            },
            Packet::ProxySubscribe {
                group_names: vec!["lobby".to_string()],
            },
        ] {
            write_packet(&mut stranger, &packet).await.unwrap();
        }
        // The snapshot answers the last packet, so the others were handled.
        assert!(matches!(
            next(&mut stranger).await,
            Some(Packet::RoutingUpdate(_))
        ));

        let instance = h.registry.instance(&id).unwrap();
        assert_eq!(instance.state, InstanceState::Online);
        assert_eq!(instance.player_count, 0);
        assert_eq!(h.server.connections().bound(&id).unwrap().peer, owner.local_addr().unwrap());

        // The owner's own, older timestamp is still accepted.
        write_packet(
            &mut owner,
            &Packet::Heartbeat {
                instance_id: id.clone(),
                timestamp: 1,
                player_count: 4,
                load_metric: 0.2,
            },
        )
        .await
        .unwrap();
        assert!(eventually(|| registry.instance(&id).is_some_and(|i| i.player_count == 4)).await);
    }

    #[tokio::test]
    async fn platform_mismatch_is_ignored() {
        let h = start(None).await;
        let id = starting_instance(&h.registry);
        let (mut stream, _) = connect(h.addr, PROTOCOL_VERSION, None).await;

        write_packet(
            &mut stream,
            &Packet::RegisterInstance {
                instance_id: id.clone(),
                platform: Platform::Velocity,
                reported_port: 30000,
            },
        )
        .await
        .unwrap();
        // A subscribe round-trip orders the check after the register.
        write_packet(&mut stream, &Packet::ProxySubscribe { group_names: vec![] })
            .await
            .unwrap();
        let server = h.server.clone();
        assert!(eventually(|| !server.proxy_connections().is_empty()).await);

        assert!(!h.server.connections().send_shutdown(&id));
    }

    #[tokio::test]
    async fn proxy_receives_snapshot_and_updates() {
        let h = start(None).await;
        let (mut proxy, _) = connect(h.addr, PROTOCOL_VERSION, None).await;
        write_packet(
            &mut proxy,
            &Packet::ProxySubscribe {
                group_names: vec!["lobby".to_string()],
            },
        )
        .await
        .unwrap();

        match next(&mut proxy).await {
            Some(Packet::RoutingUpdate(u)) => {
                assert!(u.full);
                assert!(u.entries.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let id = starting_instance(&h.registry);
        h.registry
            .apply_transition(&id, TransitionEvent::HeartbeatOk)
            .unwrap();
        match next(&mut proxy).await {
            Some(Packet::RoutingUpdate(u)) => {
                assert!(!u.full);
                assert_eq!(u.entries[0].instance_id, id);
            }
            other => panic!("unexpected {other:?}"),
        }

        let proxies = h.server.proxy_connections();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].groups, vec!["lobby".to_string()]);
        assert_eq!(proxies[0].protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn malformed_frame_closes_only_that_connection() {
        use tokio::io::AsyncWriteExt;

        let h = start(None).await;
        let (mut bad, _) = connect(h.addr, PROTOCOL_VERSION, None).await;
        let (mut good, _) = connect(h.addr, PROTOCOL_VERSION, None).await;

        bad.write_all(&[0, 0, 0, 1, 0x7f]).await.unwrap();
        assert_eq!(next(&mut bad).await, None);

        write_packet(
            &mut good,
            &Packet::ProxySubscribe {
                group_names: vec!["lobby".to_string()],
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            next(&mut good).await,
            Some(Packet::RoutingUpdate(_))
        ));
        let server = h.server.clone();
        assert!(eventually(|| server.connections().len() == 1).await);
    }
}
