//! Relay channel framing.
//!
//! The controller and its agents exchange length-prefixed JSON frames over
//! a plain TCP stream: a little-endian u32 length followed by the message
//! body. File bodies never travel on this channel; they go back over HTTP.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Control frames are small; anything larger is a protocol violation.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Messages flowing on the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Controller -> agent, immediately after accept.
    Challenge { token: String },
    /// Agent -> controller: name plus proof over the challenge token.
    Hello { agent: String, proof: String },
    /// Controller -> agent: accepted; proof over the agent's proof makes
    /// the authentication mutual.
    Welcome { proof: String },
    /// Controller -> agent: handshake failed.
    Denied { reason: String },
    /// Controller -> agent: push this file over HTTP.
    RequestFile { id: Uuid, filename: String },
    Ping,
    Pong,
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RelayMessage,
) -> Result<()> {
    let body = serde_json::to_vec(message)
        .map_err(|e| AppError::TransportFailure(format!("failed to encode frame: {}", e)))?;
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Try to parse a complete frame from the buffer.
///
/// Returns `None` if there isn't enough data for a complete frame.
pub fn try_parse_frame(buffer: &mut BytesMut) -> Option<Result<RelayMessage>> {
    if buffer.len() < 4 {
        return None;
    }

    let frame_len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Some(Err(AppError::TransportFailure(format!(
            "relay frame of {} bytes exceeds limit",
            frame_len
        ))));
    }
    if buffer.len() < 4 + frame_len {
        return None;
    }

    buffer.advance(4);
    let body = buffer.split_to(frame_len);
    Some(
        serde_json::from_slice(&body)
            .map_err(|e| AppError::TransportFailure(format!("failed to parse frame: {}", e))),
    )
}

/// Read the next frame, filling `buffer` from the stream as needed.
///
/// Returns `Ok(None)` on a clean remote close.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<RelayMessage>> {
    loop {
        if let Some(parsed) = try_parse_frame(buffer) {
            return parsed.map(Some);
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(AppError::TransportFailure(
                "relay peer closed mid-frame".to_string(),
            ));
        }
    }
}
