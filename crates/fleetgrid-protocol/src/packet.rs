//! Packet types and their payload encoding.
//!
//! | id   | packet           | direction            |
//! |------|------------------|----------------------|
//! | 0x01 | Handshake        | agent → orchestrator |
//! | 0x02 | HandshakeAck     | orchestrator → agent |
//! | 0x10 | RegisterInstance | agent → orchestrator |
//! | 0x11 | Heartbeat        | agent → orchestrator |
//! | 0x12 | Deregister       | agent → orchestrator |
//! | 0x20 | ProxySubscribe   | proxy → orchestrator |
//! | 0x21 | RoutingUpdate    | orchestrator → proxy |
//! | 0x30 | DrainCommand     | orchestrator → agent |
//! | 0x31 | ShutdownCommand  | orchestrator → agent |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fleetgrid_state::Platform;

use crate::error::{ProtocolError, ProtocolResult};

/// Version spoken by this build. A handshake with any other version is refused.
pub const PROTOCOL_VERSION: u16 = 1;

pub const HANDSHAKE: u8 = 0x01;
pub const HANDSHAKE_ACK: u8 = 0x02;
pub const REGISTER_INSTANCE: u8 = 0x10;
pub const HEARTBEAT: u8 = 0x11;
pub const DEREGISTER: u8 = 0x12;
pub const PROXY_SUBSCRIBE: u8 = 0x20;
pub const ROUTING_UPDATE: u8 = 0x21;
pub const DRAIN_COMMAND: u8 = 0x30;
pub const SHUTDOWN_COMMAND: u8 = 0x31;

/// One backend in a routing update.
///
/// A removal is encoded as an entry with port 0 and an empty address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
}

impl RouteEntry {
    pub fn removal(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            address: String::new(),
            port: 0,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.port == 0 && self.address.is_empty()
    }
}

/// Routing table change for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingUpdate {
    pub group_name: String,
    /// True when `entries` is the complete ONLINE set of the group.
    pub full: bool,
    pub entries: Vec<RouteEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake {
        protocol_version: u16,
        token: Option<String>,
    },
    HandshakeAck {
        accepted: bool,
        reason: Option<String>,
    },
    RegisterInstance {
        instance_id: String,
        platform: Platform,
        reported_port: u16,
    },
    Heartbeat {
        instance_id: String,
        timestamp: u64,
        player_count: u32,
        load_metric: f64,
    },
    Deregister {
        instance_id: String,
        reason: String,
    },
    ProxySubscribe {
        group_names: Vec<String>,
    },
    RoutingUpdate(RoutingUpdate),
    DrainCommand {
        instance_id: String,
        grace_millis: u64,
    },
    ShutdownCommand {
        instance_id: String,
    },
}

impl Packet {
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Handshake { .. } => HANDSHAKE,
            Packet::HandshakeAck { .. } => HANDSHAKE_ACK,
            Packet::RegisterInstance { .. } => REGISTER_INSTANCE,
            Packet::Heartbeat { .. } => HEARTBEAT,
            Packet::Deregister { .. } => DEREGISTER,
            Packet::ProxySubscribe { .. } => PROXY_SUBSCRIBE,
            Packet::RoutingUpdate(_) => ROUTING_UPDATE,
            Packet::DrainCommand { .. } => DRAIN_COMMAND,
            Packet::ShutdownCommand { .. } => SHUTDOWN_COMMAND,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "handshake",
            Packet::HandshakeAck { .. } => "handshake_ack",
            Packet::RegisterInstance { .. } => "register_instance",
            Packet::Heartbeat { .. } => "heartbeat",
            Packet::Deregister { .. } => "deregister",
            Packet::ProxySubscribe { .. } => "proxy_subscribe",
            Packet::RoutingUpdate(_) => "routing_update",
            Packet::DrainCommand { .. } => "drain_command",
            Packet::ShutdownCommand { .. } => "shutdown_command",
        }
    }

    /// Append this packet's payload (without the type byte) to `buf`.
    pub fn encode_payload(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            Packet::Handshake {
                protocol_version,
                token,
            } => {
                buf.put_u16(*protocol_version);
                put_opt_string(buf, token.as_deref())?;
            }
            Packet::HandshakeAck { accepted, reason } => {
                buf.put_u8(u8::from(*accepted));
                put_opt_string(buf, reason.as_deref())?;
            }
            Packet::RegisterInstance {
                instance_id,
                platform,
                reported_port,
            } => {
                put_string(buf, instance_id)?;
                buf.put_u8(platform.wire_id());
                buf.put_u16(*reported_port);
            }
            Packet::Heartbeat {
                instance_id,
                timestamp,
                player_count,
                load_metric,
            } => {
                put_string(buf, instance_id)?;
                buf.put_u64(*timestamp);
                buf.put_u32(*player_count);
                buf.put_f64(*load_metric);
            }
            Packet::Deregister {
                instance_id,
                reason,
            } => {
                put_string(buf, instance_id)?;
                put_string(buf, reason)?;
            }
            Packet::ProxySubscribe { group_names } => {
                put_count(buf, group_names.len())?;
                for name in group_names {
                    put_string(buf, name)?;
                }
            }
            Packet::RoutingUpdate(update) => {
                put_string(buf, &update.group_name)?;
                buf.put_u8(u8::from(update.full));
                put_count(buf, update.entries.len())?;
                for entry in &update.entries {
                    put_string(buf, &entry.instance_id)?;
                    put_string(buf, &entry.address)?;
                    buf.put_u16(entry.port);
                }
            }
            Packet::DrainCommand {
                instance_id,
                grace_millis,
            } => {
                put_string(buf, instance_id)?;
                buf.put_u64(*grace_millis);
            }
            Packet::ShutdownCommand { instance_id } => {
                put_string(buf, instance_id)?;
            }
        }
        Ok(())
    }

    /// Decode a payload of the given packet type. Trailing bytes are rejected.
    pub fn decode(packet_type: u8, mut payload: Bytes) -> ProtocolResult<Packet> {
        let buf = &mut payload;
        let packet = match packet_type {
            HANDSHAKE => Packet::Handshake {
                protocol_version: get_u16(buf)?,
                token: get_opt_string(buf)?,
            },
            HANDSHAKE_ACK => Packet::HandshakeAck {
                accepted: get_bool(buf)?,
                reason: get_opt_string(buf)?,
            },
            REGISTER_INSTANCE => {
                let instance_id = get_string(buf)?;
                let raw = get_u8(buf)?;
                let platform = Platform::from_wire_id(raw)
                    .ok_or_else(|| ProtocolError::malformed(format!("unknown platform id {raw}")))?;
                Packet::RegisterInstance {
                    instance_id,
                    platform,
                    reported_port: get_u16(buf)?,
                }
            }
            HEARTBEAT => Packet::Heartbeat {
                instance_id: get_string(buf)?,
                timestamp: get_u64(buf)?,
                player_count: get_u32(buf)?,
                load_metric: get_f64(buf)?,
            },
            DEREGISTER => Packet::Deregister {
                instance_id: get_string(buf)?,
                reason: get_string(buf)?,
            },
            PROXY_SUBSCRIBE => {
                let count = get_u16(buf)?;
                let mut group_names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    group_names.push(get_string(buf)?);
                }
                Packet::ProxySubscribe { group_names }
            }
            ROUTING_UPDATE => {
                let group_name = get_string(buf)?;
                let full = get_bool(buf)?;
                let count = get_u16(buf)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(RouteEntry {
                        instance_id: get_string(buf)?,
                        address: get_string(buf)?,
                        port: get_u16(buf)?,
                    });
                }
                Packet::RoutingUpdate(RoutingUpdate {
                    group_name,
                    full,
                    entries,
                })
            }
            DRAIN_COMMAND => Packet::DrainCommand {
                instance_id: get_string(buf)?,
                grace_millis: get_u64(buf)?,
            },
            SHUTDOWN_COMMAND => Packet::ShutdownCommand {
                instance_id: get_string(buf)?,
            },
            other => return Err(ProtocolError::UnknownPacket(other)),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::malformed(format!(
                "{} trailing byte(s) after {}",
                buf.remaining(),
                packet.name()
            )));
        }
        Ok(packet)
    }
}

// ── Primitives ────────────────────────────────────────────────────

fn put_count(buf: &mut BytesMut, count: usize) -> ProtocolResult<()> {
    let count = u16::try_from(count)
        .map_err(|_| ProtocolError::malformed(format!("list of {count} items is too long")))?;
    buf.put_u16(count);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> ProtocolResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::malformed(format!("string of {} bytes is too long", value.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) -> ProtocolResult<()> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_string(buf, v)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn need(buf: &Bytes, n: usize) -> ProtocolResult<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::malformed(format!(
            "truncated payload: need {n} byte(s), have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> ProtocolResult<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> ProtocolResult<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> ProtocolResult<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> ProtocolResult<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_f64(buf: &mut Bytes) -> ProtocolResult<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_bool(buf: &mut Bytes) -> ProtocolResult<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::malformed(format!("invalid bool byte {other}"))),
    }
}

fn get_string(buf: &mut Bytes) -> ProtocolResult<String> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::malformed("invalid UTF-8 in string"))
}

fn get_opt_string(buf: &mut Bytes) -> ProtocolResult<Option<String>> {
    if get_bool(buf)? {
        Ok(Some(get_string(buf)?))
    } else {
        Ok(None)
    }
}
