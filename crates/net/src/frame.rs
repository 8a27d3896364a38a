//! Message framing over a QUIC stream.
//!
//! One wire message per frame: `[u32 len][len bytes]`, little-endian. The
//! stream carries nothing else, so a framing error is unrecoverable and the
//! connection is torn down.

use anyhow::{Context, Result};
use quinn::{RecvStream, SendStream};

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Write one length-prefixed frame.
pub async fn write_frame(send: &mut SendStream, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).context("frame too large for length prefix")?;
    send.write_all(&len.to_le_bytes())
        .await
        .context("failed to write frame length")?;
    send.write_all(bytes)
        .await
        .context("failed to write frame body")?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer finished the stream cleanly at a frame
/// boundary.
pub async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match recv.read_exact(&mut len_bytes).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut body = vec![0u8; len];
    recv.read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok(Some(body))
}
