//! Length-prefixed binary framing for the control channel.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//!  offset  size  field
//!    0      1    version (=1)
//!    1      1    message type
//!    2      4    tunnel id (0 for channel-scoped messages)
//!    6      4    payload length N
//!   10      N    payload bytes
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, MAX_PAYLOAD_LEN};
use crate::MessageType;

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 10;

/// A single frame as it appears on the wire: a type tag, the tunnel it
/// belongs to (0 for channel-scoped messages such as `Auth`/`Heartbeat`),
/// and an opaque payload. Payload interpretation is the caller's job —
/// see [`crate::message`] for the typed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub tunnel_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, tunnel_id: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            tunnel_id,
            payload,
        }
    }

    /// Serializes this frame to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(FRAME_VERSION);
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.tunnel_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Reads one frame from an async reader. Returns `Ok(None)` on a clean
    /// EOF before any header bytes were read; any other truncation is
    /// reported as [`ProtocolError::Truncated`].
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Option<Frame>, ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(|_| ProtocolError::Truncated)?;

        let version = header[0];
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::try_from(header[1])?;
        let tunnel_id = u32::from_be_bytes(header[2..6].try_into().unwrap());
        let len = u32::from_be_bytes(header[6..10].try_into().unwrap());
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(len));
        }

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|_| ProtocolError::Truncated)?;

        Ok(Some(Frame {
            msg_type,
            tunnel_id,
            payload,
        }))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_buffer() {
        let frame = Frame::new(MessageType::Data, 42, b"hello".to_vec());
        let bytes = frame.encode();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Frame::read_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn concatenated_frames_parse_in_order() {
        let a = Frame::new(MessageType::Heartbeat, 0, vec![]);
        let b = Frame::new(MessageType::Data, 7, vec![1, 2, 3]);
        let mut bytes = a.encode();
        bytes.extend(b.encode());
        let mut cursor = std::io::Cursor::new(bytes);
        let first = Frame::read_from(&mut cursor).await.unwrap().unwrap();
        let second = Frame::read_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(Frame::read_from(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_length_prefix() {
        let mut header = vec![FRAME_VERSION, MessageType::Data as u8];
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(header);
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge(_)));
    }
}
