//! Bidirectional byte relays for blind tunnels
//!
//! TCP-to-TCP tunnels get one copier per direction, each propagating EOF by
//! half-closing its write side so protocols that signal end-of-stream with a
//! one-way FIN keep working. Tunnels involving a TLS leg fall back to a
//! joined copy that fully closes both ends once both directions finish.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Splice two TCP streams with FIN propagation per direction.
pub(crate) async fn splice_half_close(client: TcpStream, origin: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut origin_read, mut origin_write) = origin.into_split();

    let upstream = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut client_read, &mut origin_write).await {
            warn!(error = %e, "error copying to origin");
        }
        let _ = origin_write.shutdown().await;
    });
    let downstream = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut origin_read, &mut client_write).await {
            warn!(error = %e, "error copying to client");
        }
        let _ = client_write.shutdown().await;
    });

    let _ = tokio::join!(upstream, downstream);
}

/// Splice two streams without half-close support; both ends are closed once
/// both directions are done.
pub(crate) async fn splice_joined<A, B>(mut a: A, mut b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "tunnel drained"),
        Err(e) => warn!(error = %e, "tunnel copy failed"),
    }
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}
