//! fleetgrid-control — the control protocol server.
//!
//! Platform agents and proxies connect over TCP, complete a handshake, and
//! then exchange length-prefixed packets with the orchestrator.
//!
//! # Architecture
//!
//! ```text
//! TcpListener ─► per-connection task
//!                  ├── handshake (deadline, version, token) ─► HandshakeAck
//!                  ├── reader loop ─► dispatch
//!                  │     RegisterInstance ─► bind command channel
//!                  │     Heartbeat        ─► HealthMonitor
//!                  │     Deregister       ─► LifecycleController
//!                  │     ProxySubscribe   ─► RoutingPublisher
//!                  └── writer task ◄── bounded queue ◄── routing updates,
//!                                                       drain/shutdown commands
//! ```
//!
//! A malformed frame or a full outbound queue closes that connection only.

pub mod connection;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionTable, ProxyConnection};
pub use server::{ControlServer, ControlSettings};
