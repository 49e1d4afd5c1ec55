//! Length-prefixed message framing.
//!
//! Every message on a tether stream is a 4-byte little-endian length
//! followed by exactly that many bytes of JSON. The same framing carries the
//! handshake and, afterwards, the multiplexed RPC frames.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

impl FramingError {
    /// True if the peer closed the stream cleanly before a new frame began.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Serialize `message` and write it as a single frame.
///
/// The prefix and payload are assembled into one buffer so a frame is never
/// interleaved with another writer's bytes at the `write_all` level.
pub async fn send_message<W, M>(writer: &mut W, message: &M) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
    M: Serialize + ?Sized,
{
    let buf = encode_message(message)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize `message` into on-wire bytes without writing anything.
pub fn encode_message<M>(message: &M) -> Result<Vec<u8>, FramingError>
where
    M: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message).map_err(FramingError::Encode)?;
    encode_frame(&payload)
}

/// Read exactly one frame and deserialize it.
pub async fn receive_message<R, M>(reader: &mut R) -> Result<M, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
    M: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(FramingError::Decode)
}

/// Build the on-wire bytes for an already-serialized payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
