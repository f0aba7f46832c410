//! Frame I/O over tokio streams.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Packet;

/// Upper bound on `length` (type byte plus payload).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a packet into a complete frame.
pub fn encode_frame(packet: &Packet) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(0);
    buf.put_u8(packet.packet_type());
    packet.encode_payload(&mut buf)?;

    let len = buf.len() - 4;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    buf[..4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(buf.freeze())
}

/// Read one packet. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_packet<R>(reader: &mut R) -> ProtocolResult<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::malformed("stream ended inside a frame header"));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ProtocolError::malformed("empty frame"));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::malformed("stream ended inside a frame")
        } else {
            ProtocolError::Io(e)
        }
    })?;

    let mut body = Bytes::from(body);
    let packet_type = body.split_to(1)[0];
    Packet::decode(packet_type, body).map(Some)
}

/// Write one packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PROTOCOL_VERSION, RouteEntry, RoutingUpdate};

    #[test]
    fn frame_length_counts_type_byte() {
        let frame = encode_frame(&Packet::ShutdownCommand {
            instance_id: "lobby-1".to_string(),
        })
        .unwrap();
        // 1 type byte + 2 length bytes + 7 string bytes
        assert_eq!(&frame[..4], &10u32.to_be_bytes());
        assert_eq!(frame[4], 0x31);
        assert_eq!(frame.len(), 14);
    }

    #[tokio::test]
    async fn packets_survive_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = vec![
            Packet::Handshake {
                protocol_version: PROTOCOL_VERSION,
                token: Some("s3cret".to_string()),
            },
            Packet::Heartbeat {
                instance_id: "lobby-1".to_string(),
                timestamp: 1_700_000_000_000,
                player_count: 12,
                load_metric: 0.75,
            },
            Packet::RoutingUpdate(RoutingUpdate {
                group_name: "lobby".to_string(),
                full: true,
                entries: vec![RouteEntry {
                    instance_id: "lobby-1".to_string(),
                    address: "127.0.0.1".to_string(),
                    port: 30000,
                }],
            }),
        ];
        for p in &sent {
            write_packet(&mut client, p).await.unwrap();
        }
        drop(client);

        let mut received = Vec::new();
        while let Some(p) = read_packet(&mut server).await.unwrap() {
            received.push(p);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn unknown_packet_id_is_reported() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 1, 0x99]).await.unwrap();

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPacket(0x99)));
    }

    #[tokio::test]
    async fn eof_inside_frame_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 0x31, 0]).await.unwrap();
        drop(client);

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn eof_inside_length_header_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn eof_between_frames_is_a_clean_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_packet(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_frame_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 0]).await.unwrap();

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }
}
