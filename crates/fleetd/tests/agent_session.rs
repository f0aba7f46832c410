//! Agent and proxy sessions over TCP against a running fleet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetd::{Fleet, FleetTasks};
use fleetgrid_core::FleetConfig;
use fleetgrid_lifecycle::MemoryRuntime;
use fleetgrid_protocol::{PROTOCOL_VERSION, Packet, read_packet, write_packet};
use fleetgrid_state::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt;

const CONFIG: &str = r#"
[server]
token = "s3cret"
handshake_timeout = "1s"

[health]
interval = "1h"

[autoscaler]
interval = "1h"

[lifecycle]
drain_grace = "5s"

[[groups]]
name = "lobby"
platform = "paper"

[groups.policy]
min_instances = 0
max_instances = 3
scale_up_threshold = 20.0
scale_down_threshold = 5.0

[groups.template]
image = "ghcr.io/acme/lobby:1.4"
port_range = { start = 30000, end = 30009 }
host_address = "10.0.0.5"
"#;

struct Running {
    fleet: Fleet,
    runtime: Arc<MemoryRuntime>,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: FleetTasks,
}

async fn start() -> Running {
    let config = FleetConfig::from_toml(CONFIG).unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let fleet = Fleet::assemble(
        &config,
        GroupStore::open_in_memory().unwrap(),
        runtime.clone(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let tasks = fleet.start(listener, rx);

    Running {
        fleet,
        runtime,
        addr,
        shutdown,
        tasks,
    }
}

async fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send(
        &mut stream,
        Packet::Handshake {
            protocol_version: PROTOCOL_VERSION,
            token: Some("s3cret".to_string()),
        },
    )
    .await;
    assert_eq!(
        next(&mut stream).await,
        Some(Packet::HandshakeAck {
            accepted: true,
            reason: None
        })
    );
    stream
}

async fn send(stream: &mut TcpStream, packet: Packet) {
    write_packet(stream, &packet).await.unwrap();
}

async fn next(stream: &mut TcpStream) -> Option<Packet> {
    tokio::time::timeout(Duration::from_secs(3), read_packet(stream))
        .await
        .expect("read timed out")
        .unwrap_or(None)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn stop(running: Running) {
    running.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), running.tasks.join())
        .await
        .expect("background tasks did not stop");
}

#[tokio::test]
async fn agent_goes_online_and_proxy_sees_drain_before_shutdown() {
    let running = start().await;
    let fleet = &running.fleet;

    let id = fleet.lifecycle.provision("lobby", 1).await.unwrap()[0].clone();
    let port = fleet.registry.instance(&id).unwrap().port;

    let mut agent = connect(running.addr).await;
    send(
        &mut agent,
        Packet::RegisterInstance {
            instance_id: id.clone(),
            platform: Platform::Paper,
            reported_port: port,
        },
    )
    .await;
    send(
        &mut agent,
        Packet::Heartbeat {
            instance_id: id.clone(),
            timestamp: 1,
            player_count: 12,
            load_metric: 0.4,
        },
    )
    .await;
    let registry = fleet.registry.clone();
    let watched = id.clone();
    assert!(
        eventually(|| registry
            .instance(&watched)
            .is_some_and(|i| i.state == InstanceState::Online))
        .await
    );

    let mut proxy = connect(running.addr).await;
    send(
        &mut proxy,
        Packet::ProxySubscribe {
            group_names: vec!["lobby".to_string()],
        },
    )
    .await;
    let Some(Packet::RoutingUpdate(snapshot)) = next(&mut proxy).await else {
        panic!("expected routing snapshot");
    };
    assert!(snapshot.full);
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].instance_id, id);
    assert_eq!(snapshot.entries[0].address, "10.0.0.5");
    assert_eq!(snapshot.entries[0].port, port);
    assert_eq!(fleet.control.proxy_connections().len(), 1);

    let router = fleetgrid_api::build_router(fleet.api_state());
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/instances/{id}/terminate"))
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let Some(Packet::RoutingUpdate(removal)) = next(&mut proxy).await else {
        panic!("expected routing removal");
    };
    assert!(!removal.full);
    assert_eq!(removal.entries[0].instance_id, id);
    assert!(removal.entries[0].is_removal());

    assert_eq!(
        next(&mut agent).await,
        Some(Packet::DrainCommand {
            instance_id: id.clone(),
            grace_millis: 5_000,
        })
    );
    // Players are gone; the container still runs until the agent says so.
    assert_eq!(running.runtime.running_count(), 1);
    send(
        &mut agent,
        Packet::Deregister {
            instance_id: id.clone(),
            reason: "drained".to_string(),
        },
    )
    .await;
    assert_eq!(
        next(&mut agent).await,
        Some(Packet::ShutdownCommand {
            instance_id: id.clone()
        })
    );

    let watched = id.clone();
    assert!(eventually(|| registry.is_tombstoned(&watched)).await);
    assert_eq!(running.runtime.container_count(), 0);
    let group = fleet.registry.group("lobby").unwrap();
    assert_eq!(group.terminations[0].reason, TerminationReason::Manual);

    stop(running).await;
}

#[tokio::test]
async fn agent_deregister_while_online_terminates_instance() {
    let running = start().await;
    let fleet = &running.fleet;

    let id = fleet.lifecycle.provision("lobby", 1).await.unwrap()[0].clone();
    let mut agent = connect(running.addr).await;
    send(
        &mut agent,
        Packet::Heartbeat {
            instance_id: id.clone(),
            timestamp: 1,
            player_count: 0,
            load_metric: 0.0,
        },
    )
    .await;
    let registry = fleet.registry.clone();
    let watched = id.clone();
    assert!(
        eventually(|| registry
            .instance(&watched)
            .is_some_and(|i| i.state == InstanceState::Online))
        .await
    );

    // The heartbeat bound this connection. The agent is leaving on its own,
    // so it gets no drain command, only the shutdown.
    send(
        &mut agent,
        Packet::Deregister {
            instance_id: id.clone(),
            reason: "server stopping".to_string(),
        },
    )
    .await;
    assert_eq!(
        next(&mut agent).await,
        Some(Packet::ShutdownCommand {
            instance_id: id.clone()
        })
    );

    let watched = id.clone();
    assert!(eventually(|| registry.is_tombstoned(&watched)).await);
    let group = fleet.registry.group("lobby").unwrap();
    assert_eq!(group.terminations[0].reason, TerminationReason::Deregistered);
    assert_eq!(running.runtime.container_count(), 0);

    stop(running).await;
}

#[tokio::test]
async fn registration_alone_makes_instance_routable() {
    let running = start().await;
    let fleet = &running.fleet;
    let id = fleet.lifecycle.provision("lobby", 1).await.unwrap()[0].clone();
    let port = fleet.registry.instance(&id).unwrap().port;

    let mut proxy = connect(running.addr).await;
    send(
        &mut proxy,
        Packet::ProxySubscribe {
            group_names: vec!["lobby".to_string()],
        },
    )
    .await;
    let Some(Packet::RoutingUpdate(snapshot)) = next(&mut proxy).await else {
        panic!("expected routing snapshot");
    };
    assert!(snapshot.entries.is_empty());

    let mut agent = connect(running.addr).await;
    send(
        &mut agent,
        Packet::RegisterInstance {
            instance_id: id.clone(),
            platform: Platform::Paper,
            reported_port: port,
        },
    )
    .await;

    let Some(Packet::RoutingUpdate(added)) = next(&mut proxy).await else {
        panic!("expected routing update");
    };
    assert!(!added.full);
    assert_eq!(added.entries[0].instance_id, id);
    assert_eq!(added.entries[0].port, port);
    assert_eq!(
        fleet.registry.instance(&id).unwrap().state,
        InstanceState::Online
    );

    stop(running).await;
}

#[tokio::test]
async fn closed_connections_are_forgotten() {
    let running = start().await;

    let mut proxy = connect(running.addr).await;
    send(
        &mut proxy,
        Packet::ProxySubscribe {
            group_names: vec!["lobby".to_string()],
        },
    )
    .await;
    assert!(matches!(
        next(&mut proxy).await,
        Some(Packet::RoutingUpdate(_))
    ));
    assert_eq!(running.fleet.routing.subscriber_count(), 1);

    drop(proxy);
    let routing = running.fleet.routing.clone();
    assert!(eventually(|| routing.subscriber_count() == 0).await);
    let connections = running.fleet.control.connections();
    assert!(eventually(|| connections.is_empty()).await);

    stop(running).await;
}
