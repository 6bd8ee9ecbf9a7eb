//! WebSocket pass-through
//!
//! Upgrade handshakes are detected inside MITM sessions, forwarded verbatim,
//! and the session then degrades into a symmetric byte pipe. Bridges exist
//! for both TLS and plaintext targets; Remote Desktop Gateway methods look
//! like upgrades but are handled by the raw RDG splice instead.

use crate::http1::{self, header_contains, FrameError, HttpRequest, HttpResponse};
use crate::tls::{self, webpki_client_config};
use crate::upstream::DialError;
use rustls::ClientConfig;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// WebSocket bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("cannot dial websocket target: {0}")]
    Dial(#[from] DialError),

    #[error("invalid websocket target: {0}")]
    BadTarget(String),
}

/// True when the request asks for a WebSocket upgrade: `Connection`
/// containing `upgrade` and `Upgrade` containing `websocket`, both
/// case-insensitive across comma-separated values. RDG methods never count.
pub fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    if req.method.contains("RDG") {
        return false;
    }
    header_contains(&req.headers, "connection", "upgrade")
        && header_contains(&req.headers, "upgrade", "websocket")
}

/// Forward the client's handshake to the origin, relay exactly one response
/// back, and report it.
pub(crate) async fn forward_handshake<O, C>(
    req: &HttpRequest,
    origin: &mut O,
    client: &mut C,
) -> Result<HttpResponse, FrameError>
where
    O: AsyncBufRead + AsyncWrite + Unpin,
    C: AsyncWrite + Unpin,
{
    http1::write_request(origin, req).await?;
    let resp = http1::read_response(origin).await?;
    http1::write_response(client, &resp).await?;
    Ok(resp)
}

/// Symmetric full-duplex pipe; the first direction to error or reach EOF
/// tears the whole bridge down.
pub(crate) async fn pipe<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = result {
                warn!(error = %e, "websocket pipe ended");
            }
        }
        result = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = result {
                warn!(error = %e, "websocket pipe ended");
            }
        }
    }
}

/// Bridge a WebSocket upgrade to a TLS origin: dial with the given client
/// config, forward the handshake, then pipe until either side closes.
pub async fn bridge_websocket_tls<C>(
    config: Arc<ClientConfig>,
    req: &HttpRequest,
    client: C,
) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (addr, hostname) = bridge_target(req, 443)?;
    debug!(target = %addr, "bridging websocket over TLS");

    let tcp = TcpStream::connect(&addr).await?;
    let connector = TlsConnector::from(config);
    let name = tls::server_name(&hostname)
        .map_err(|e| BridgeError::BadTarget(e.to_string()))?;
    let origin = connector.connect(name, tcp).await?;

    let mut origin = BufReader::new(origin);
    let mut client = client;
    forward_handshake(req, &mut origin, &mut client).await?;

    pipe(client, origin.into_inner()).await;
    Ok(())
}

/// Bridge a plaintext-seen WebSocket upgrade, dialing by target scheme
/// (`https` gets TLS, anything else raw TCP), forwarding the request, then
/// piping both directions until the first error or EOF.
pub async fn bridge_websocket<C>(req: &HttpRequest, client: C) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let secure = req.target.starts_with("https://") || req.target.starts_with("wss://");
    let default_port = if secure { 443 } else { 80 };
    let (addr, hostname) = bridge_target(req, default_port)?;
    debug!(target = %addr, secure = secure, "bridging websocket");

    let tcp = TcpStream::connect(&addr).await?;
    if secure {
        let connector = TlsConnector::from(Arc::new(webpki_client_config()));
        let name = tls::server_name(&hostname)
            .map_err(|e| BridgeError::BadTarget(e.to_string()))?;
        let mut origin = connector.connect(name, tcp).await?;
        http1::write_request(&mut origin, req).await?;
        pipe(client, origin).await;
    } else {
        let mut origin = tcp;
        http1::write_request(&mut origin, req).await?;
        pipe(client, origin).await;
    }
    Ok(())
}

/// Resolve the dial address and SNI hostname for a bridge request.
fn bridge_target(req: &HttpRequest, default_port: u16) -> Result<(String, String), BridgeError> {
    if req.target.contains("://") {
        let url = Url::parse(&req.target).map_err(|e| BridgeError::BadTarget(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::BadTarget("missing host".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(default_port);
        return Ok((format!("{}:{}", host, port), host));
    }

    let authority = req
        .host()
        .ok_or_else(|| BridgeError::BadTarget("no Host header".to_string()))?;
    let hostname = tls::strip_port(authority).to_string();
    let addr = if tls::has_port(authority) {
        authority.to_string()
    } else {
        format!("{}:{}", hostname, default_port)
    };
    Ok((addr, hostname))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            target: "/socket".to_string(),
            version: 1,
            headers: vec![
                ("Host".to_string(), "a.b".to_string()),
                ("Connection".to_string(), "keep-alive, Upgrade".to_string()),
                ("Upgrade".to_string(), "WebSocket".to_string()),
            ],
            body: Vec::new(),
        }
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_websocket_upgrade(&upgrade_request()));
    }

    #[test]
    fn test_upgrade_requires_both_headers() {
        let mut req = upgrade_request();
        req.headers.retain(|(n, _)| !n.eq_ignore_ascii_case("upgrade"));
        assert!(!is_websocket_upgrade(&req));

        let mut req = upgrade_request();
        req.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("connection"));
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn test_rdg_methods_are_never_websocket() {
        let mut req = upgrade_request();
        req.method = "RDG_OUT_DATA".to_string();
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn test_bridge_target_resolution() {
        let mut req = upgrade_request();
        let (addr, host) = bridge_target(&req, 443).unwrap();
        assert_eq!(addr, "a.b:443");
        assert_eq!(host, "a.b");

        req.target = "https://c.d:8443/socket".to_string();
        let (addr, host) = bridge_target(&req, 443).unwrap();
        assert_eq!(addr, "c.d:8443");
        assert_eq!(host, "c.d");
    }

    #[tokio::test]
    async fn test_handshake_forwarding() {
        let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (origin_side, mut origin_far) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut discard = [0u8; 1024];
            let _ = origin_far.read(&mut discard).await.unwrap();
            origin_far.write_all(wire).await.unwrap();
        });

        let mut origin = BufReader::new(origin_side);
        let mut client = Vec::new();
        let resp = forward_handshake(&upgrade_request(), &mut origin, &mut client)
            .await
            .unwrap();

        assert_eq!(resp.status, 101);
        let relayed = String::from_utf8(client).unwrap();
        assert!(relayed.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(relayed.contains("Upgrade: websocket\r\n"));
    }

    #[tokio::test]
    async fn test_pipe_is_full_duplex_and_stops_on_eof() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a_near, a_far) = tokio::io::duplex(4096);
        let (b_near, b_far) = tokio::io::duplex(4096);

        let bridge = tokio::spawn(pipe(a_far, b_far));

        let (mut a_read, mut a_write) = tokio::io::split(a_near);
        let (mut b_read, mut b_write) = tokio::io::split(b_near);

        a_write.write_all(b"from-a").await.unwrap();
        let mut buf = [0u8; 6];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-a");

        b_write.write_all(b"from-b").await.unwrap();
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-b");

        a_write.shutdown().await.unwrap();
        bridge.await.unwrap();
    }
}
