//! fleetgrid-protocol — the binary control protocol.
//!
//! Every frame is `[u32 BE length][u8 packet type][payload]`, where
//! `length` counts the type byte plus the payload. Payload primitives are
//! big endian: strings are a `u16` length followed by UTF-8 bytes, optional
//! strings carry a `u8` presence flag, booleans are one byte, and lists are
//! a `u16` count followed by the items.

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{encode_frame, read_packet, write_packet, MAX_FRAME_LEN};
pub use error::{ProtocolError, ProtocolResult};
pub use packet::{Packet, RouteEntry, RoutingUpdate, PROTOCOL_VERSION};
