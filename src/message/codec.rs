//! Wire format
//!
//! Every frame is a 4-byte big-endian length followed by the bincode body
//! of a [`Frame`].

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Envelope;
use crate::cluster::RejectReason;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::topology::TopologySnapshot;
use crate::types::NodeId;

/// Wire protocol version carried in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

const LENGTH_PREFIX: usize = 4;

/// Everything that can be written to a ring connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection
    Handshake { node_id: NodeId, protocol_version: u32 },
    Envelope(Envelope),
    /// Ask the receiver for its topology
    SnapshotRequest { requester: NodeId, address: SocketAddr },
    Snapshot { from: NodeId, snapshot: TopologySnapshot },
    /// Sent straight back to a candidate that cannot be admitted
    JoinRejected { candidate: NodeId, reason: RejectReason },
    Probe { node_id: NodeId },
    ProbeAck { node_id: NodeId },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "Handshake",
            Frame::Envelope(envelope) => envelope.payload.kind(),
            Frame::SnapshotRequest { .. } => "SnapshotRequest",
            Frame::Snapshot { .. } => "Snapshot",
            Frame::JoinRejected { .. } => "JoinRejected",
            Frame::Probe { .. } => "Probe",
            Frame::ProbeAck { .. } => "ProbeAck",
        }
    }
}

/// Serialize a frame with its length prefix
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> DiscoveryResult<Bytes> {
    let body = bincode::serialize(frame)?;
    if body.len() > max_frame_size {
        return Err(DiscoveryError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }
    let mut buffer = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
    buffer.put_u32(body.len() as u32);
    buffer.put_slice(&body);
    Ok(buffer.freeze())
}

/// Take one frame off the front of `buffer` if it is complete
pub fn decode_frame(buffer: &mut BytesMut, max_frame_size: usize) -> DiscoveryResult<Option<Frame>> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > max_frame_size {
        return Err(DiscoveryError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    if buffer.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    buffer.advance(LENGTH_PREFIX);
    let body = buffer.split_to(len);
    Ok(Some(bincode::deserialize(&body[..])?))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame_size: usize) -> DiscoveryResult<()>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_frame(frame, max_frame_size)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
///
/// `buffer` belongs to the connection and may hold bytes of the next frame
/// between calls. Cancelling the future loses nothing already read.
pub async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_frame_size: usize,
) -> DiscoveryResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decode_frame(buffer, max_frame_size)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buffer).await? == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(DiscoveryError::Protocol(format!(
                "connection closed with {} bytes of a partial frame",
                buffer.len()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::types::MessageId;

    fn custom(node: NodeId) -> Frame {
        Frame::Envelope(
            Envelope::new(
                MessageId::new(node, 1),
                node,
                Payload::Custom {
                    user_payload: Bytes::from_static(b"checkpoint saved"),
                },
            )
            .with_ensure_delivery(true),
        )
    }

    #[test]
    fn test_partial_buffer_waits_for_more() {
        let node = NodeId::new();
        let encoded = encode_frame(&custom(node), 1024).unwrap();

        let mut buffer = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode_frame(&mut buffer, 1024).unwrap().is_none());

        buffer.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode_frame(&mut buffer, 1024).unwrap(), Some(custom(node)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let node = NodeId::new();
        let encoded = encode_frame(&Frame::Probe { node_id: node }, 1024).unwrap();
        let declared = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(declared, encoded.len() - LENGTH_PREFIX);
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let node = NodeId::new();
        let big = Frame::Envelope(Envelope::new(
            MessageId::new(node, 1),
            node,
            Payload::Custom {
                user_payload: Bytes::from(vec![7u8; 4096]),
            },
        ));
        assert!(matches!(
            encode_frame(&big, 1024),
            Err(DiscoveryError::FrameTooLarge { max: 1024, .. })
        ));

        let mut forged = BytesMut::new();
        forged.put_u32(1 << 20);
        assert!(matches!(
            decode_frame(&mut forged, 1024),
            Err(DiscoveryError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let node = NodeId::new();
        let (mut client, mut server) = tokio::io::duplex(8192);

        write_frame(&mut client, &Frame::Handshake { node_id: node, protocol_version: PROTOCOL_VERSION }, 4096)
            .await
            .unwrap();
        write_frame(&mut client, &custom(node), 4096).await.unwrap();
        drop(client);

        let mut buffer = BytesMut::new();
        let first = read_frame(&mut server, &mut buffer, 4096).await.unwrap();
        assert!(matches!(first, Some(Frame::Handshake { protocol_version: PROTOCOL_VERSION, .. })));
        assert_eq!(read_frame(&mut server, &mut buffer, 4096).await.unwrap(), Some(custom(node)));
        assert_eq!(read_frame(&mut server, &mut buffer, 4096).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_closed_mid_frame_is_protocol_error() {
        let node = NodeId::new();
        let encoded = encode_frame(&custom(node), 4096).unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);
        client.write_all(&encoded[..encoded.len() / 2]).await.unwrap();
        drop(client);

        let mut buffer = BytesMut::new();
        assert!(matches!(
            read_frame(&mut server, &mut buffer, 4096).await,
            Err(DiscoveryError::Protocol(_))
        ));
    }
}
