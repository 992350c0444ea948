// src/ipc/frame.rs

//! Length-delimited message framing.
//!
//! Every message travels as a 4-byte little-endian length prefix followed
//! by that many bytes of UTF-8 JSON, never as a bare stream cut off
//! mid-encoding. A payload that arrives complete but fails to decode is
//! reported as [`Frame::Malformed`] so the read loop can drop it, log it
//! and keep serving the connection; only a broken prefix (oversized
//! length, truncated payload) is unrecoverable for the stream.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{JobmonError, Result};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// One frame read off the wire.
#[derive(Debug)]
pub enum Frame<T> {
    /// A complete, well-formed message.
    Msg(T),
    /// A length-correct payload that did not decode; the connection
    /// remains usable.
    Malformed(String),
}

/// Write one message as a length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        serde_json::to_vec(msg).map_err(|e| JobmonError::ProtocolDecode(format!("encode: {e}")))?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(JobmonError::ProtocolDecode(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte cap",
            payload.len()
        )));
    }
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` on clean end-of-stream (the peer closed between
/// frames). Errors are unrecoverable for this connection: an oversized
/// length prefix or a stream that ends mid-payload.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<Frame<T>>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(JobmonError::ProtocolDecode(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte cap"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    match serde_json::from_slice(&payload) {
        Ok(msg) => Ok(Some(Frame::Msg(msg))),
        Err(e) => Ok(Some(Frame::Malformed(e.to_string()))),
    }
}
