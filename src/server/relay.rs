//! Bidirectional relay between client and upstream.
//!
//! Two independent copy loops, one per direction, each moving at most one
//! 8 KiB chunk at a time. The session ends when either direction sees a
//! zero-length read or an error; the other direction's pending operation is
//! cancelled at that point and both write halves are shut down.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RELAY_CHUNK_SIZE;

/// Byte totals for one relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    /// Bytes copied client → upstream
    pub client_to_upstream: u64,
    /// Bytes copied upstream → client
    pub upstream_to_client: u64,
}

/// Pump bytes between two established duplex streams until either side
/// half-closes or errors.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayTotals
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_upstream = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    // select! drops the losing direction's future, cancelling its pending
    // read/write the moment the other direction finishes
    tokio::select! {
        r = copy_chunks(&mut client_read, &mut upstream_write, &to_upstream) => {
            if let Err(e) = r {
                tracing::debug!("Relay error (client->upstream): {}", e);
            }
        }
        r = copy_chunks(&mut upstream_read, &mut client_write, &to_client) => {
            if let Err(e) = r {
                tracing::debug!("Relay error (upstream->client): {}", e);
            }
        }
    }

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;

    RelayTotals {
        client_to_upstream: to_upstream.load(Ordering::Relaxed),
        upstream_to_client: to_client.load(Ordering::Relaxed),
    }
}

async fn copy_chunks<R, W>(reader: &mut R, writer: &mut W, total: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
}
