use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes between the client and the tunnel until either side finishes.
///
/// The two directions run concurrently; the first to complete (EOF, error or
/// reset) wins the select and both sockets are then shut down and dropped.
/// Errors end the splice but are never surfaced past this point.
pub async fn splice<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let (direction, result) = tokio::select! {
        r = tokio::io::copy(&mut client_rx, &mut upstream_tx) => ("client to tunnel", r),
        r = tokio::io::copy(&mut upstream_rx, &mut client_tx) => ("tunnel to client", r),
    };
    match result {
        Ok(bytes) => debug!("splice done, {direction} moved {bytes} bytes"),
        Err(e) => debug!("splice ended with {direction} error: {e}"),
    }

    let _ = client_tx.shutdown().await;
    let _ = upstream_tx.shutdown().await;
}
