//! Length-prefixed frame codec.
//!
//! Each frame is `[u32 big-endian byte count][payload]`. Reads are exact:
//! a frame is either consumed whole or the connection is considered dead.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body. A full-facility scan of a large lot
/// fits comfortably; anything bigger is a corrupt header.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Terminal frame-level failures. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds limit of {MAX_FRAME_LEN}")]
    Oversized(usize),

    #[error("failed to encode frame payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Read exactly one frame body.
///
/// A clean EOF before the header yields `Io(UnexpectedEof)`, which callers
/// treat as the peer closing the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one frame: header then body, flushed.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    #[allow(clippy::cast_possible_truncation)]
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a message as JSON and write it as one frame.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}
