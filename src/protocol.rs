//! Wire protocol for chatd client/server communication.
//!
//! Wire format: `[type: u8][length: u32 big-endian][payload: bytes]`
//!
//! Both frame types carry JSON payloads. The first `Envelope` a client sends
//! is its registration request; every later one is a chat message.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Chat message or registration request (both directions).
    Envelope = 0x01,
    /// Server → client: the connection is being refused.
    Error = 0x02,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Envelope),
            0x02 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Maximum frame payload size (1 MiB). Chat lines are tiny; anything larger
/// is a broken or hostile peer.
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// The unit exchanged between clients and the server.
///
/// `author` is the registered display name; `body` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub author: String,
    #[serde(default)]
    pub body: String,
}

impl Envelope {
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
        }
    }

    /// A registration request: only the author is meaningful.
    pub fn registration(name: impl Into<String>) -> Self {
        Self::new(name, String::new())
    }

    /// Whether this envelope, JSON encoded, fits in one frame.
    pub fn fits_in_frame(&self) -> bool {
        serde_json::to_vec(self).is_ok_and(|json| json.len() <= MAX_PAYLOAD_SIZE as usize)
    }
}

/// Server → Client: reason the connection was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
}

/// A protocol frame with a type tag and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Create a frame from a serializable message.
    pub fn control<T: Serialize>(frame_type: FrameType, msg: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(msg)?;
        Ok(Self::new(frame_type, Bytes::from(payload)))
    }

    /// Create an `Envelope` frame.
    pub fn envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Self::control(FrameType::Envelope, envelope)
    }

    /// Create an `Error` frame.
    pub fn error(code: &str, message: impl Into<String>) -> Result<Self, serde_json::Error> {
        let msg = ErrorMsg {
            code: code.to_string(),
            message: message.into(),
        };
        Self::control(FrameType::Error, &msg)
    }

    /// Encode this frame into bytes. Payloads over [`MAX_PAYLOAD_SIZE`] are
    /// refused, since no reader would accept them.
    pub fn encode(&self) -> io::Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload too large: {} bytes", self.payload.len()),
            ));
        }
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        Ok(buf.freeze())
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a frame from an async reader.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let type_byte = reader.read_u8().await?;
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            frame_type,
            payload: Bytes::from(payload),
        })
    }

    /// Parse the payload as JSON.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Parse an `Envelope` frame, rejecting any other frame type.
    pub fn into_envelope(self) -> io::Result<Envelope> {
        if self.frame_type != FrameType::Envelope {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected Envelope frame, got {:?}", self.frame_type),
            ));
        }
        self.parse_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
