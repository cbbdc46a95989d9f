//! Bidirectional, unframed byte relay between two matched connections.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Size of the per-direction copy buffer.
pub const FORWARD_BUFFER_SIZE: usize = 1024;

/// Pump bytes both ways until either direction ends; then both streams are dropped.
/// Returns the I/O error that ended forwarding, if any.
pub async fn forward<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let result = tokio::select! {
        r = pump(ar, bw) => r,
        r = pump(br, aw) => r,
    };
    result.map(|_| ())
}

async fn pump<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; FORWARD_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // The other side may already be gone; EOF still ends forwarding cleanly.
            if let Err(e) = writer.shutdown().await {
                debug!(relayed = total, "shutdown after EOF failed: {}", e);
            }
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
