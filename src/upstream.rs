//! Upstream (chained) proxy dialer
//!
//! When `HTTPS_PROXY` names a parent proxy, every tunnel is opened by
//! sending it a CONNECT of our own, optionally over TLS for `https`/`wss`
//! proxy URLs. The CONNECT request can be customized by the operator, e.g.
//! to add `Proxy-Authorization`.

use crate::http1::{self, FrameError, HttpRequest};
use crate::tls::{self, webpki_client_config};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

/// Cap on the rejection body quoted back in the error.
const REFUSAL_BODY_CAP: usize = 500;

/// Upstream dialing errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid upstream proxy URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported upstream proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("proxy refused connection{0}")]
    ProxyRefused(String),

    #[error("malformed proxy response: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Hook customizing the CONNECT request sent to the parent proxy.
pub type ConnectCustomizer = Arc<dyn Fn(&mut HttpRequest) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyScheme {
    Http,
    Tls,
}

/// Dialer tunneling through a parent HTTP(S) proxy.
pub struct ProxyDialer {
    scheme: ProxyScheme,
    proxy_addr: String,
    proxy_host: String,
    customizer: Option<ConnectCustomizer>,
}

impl ProxyDialer {
    /// Parse a proxy URL. `http` proxies default to port 80, `https`/`wss`
    /// to 443; any other scheme is refused.
    pub fn new(raw_url: &str) -> Result<Self, DialError> {
        let url = Url::parse(raw_url).map_err(|e| DialError::InvalidUrl(e.to_string()))?;
        let (scheme, default_port) = match url.scheme() {
            "" | "http" => (ProxyScheme::Http, 80),
            "https" | "wss" => (ProxyScheme::Tls, 443),
            other => return Err(DialError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| DialError::InvalidUrl("missing proxy host".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(default_port);

        Ok(Self {
            scheme,
            proxy_addr: format!("{}:{}", host, port),
            proxy_host: host,
            customizer: None,
        })
    }

    /// Dialer from `HTTPS_PROXY` / `https_proxy`, if either is set and
    /// parseable.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("https_proxy"))
            .ok()?;
        if raw.is_empty() {
            return None;
        }
        Self::new(&raw).ok()
    }

    /// Install a CONNECT request customizer.
    pub fn with_connect_customizer(mut self, customizer: ConnectCustomizer) -> Self {
        self.customizer = Some(customizer);
        self
    }

    /// Open a tunnel to `addr` through the parent proxy.
    pub async fn dial(&self, addr: &str) -> Result<ProxyStream, DialError> {
        debug!(proxy = %self.proxy_addr, target = %addr, "dialing through upstream proxy");
        let tcp = TcpStream::connect(&self.proxy_addr).await?;

        match self.scheme {
            ProxyScheme::Http => {
                let mut conn = tcp;
                self.send_connect(&mut conn, addr).await?;
                Ok(ProxyStream::Plain(conn))
            }
            ProxyScheme::Tls => {
                let connector = TlsConnector::from(Arc::new(webpki_client_config()));
                let name =
                    tls::server_name(&self.proxy_host).map_err(|e| DialError::Tls(e.to_string()))?;
                let mut conn = connector.connect(name, tcp).await?;
                self.send_connect(&mut conn, addr).await?;
                Ok(ProxyStream::Tls(Box::new(conn)))
            }
        }
    }

    async fn send_connect<S>(&self, conn: &mut S, addr: &str) -> Result<(), DialError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut connect_req = HttpRequest {
            method: "CONNECT".to_string(),
            target: addr.to_string(),
            version: 1,
            headers: vec![("Host".to_string(), addr.to_string())],
            body: Vec::new(),
        };
        if let Some(customizer) = &self.customizer {
            customizer(&mut connect_req);
        }

        http1::write_request(conn, &connect_req).await?;

        // A buffered reader is fine to discard afterwards: the TLS server
        // behind the tunnel will not speak until spoken to.
        let mut reader = BufReader::new(conn);
        let head = read_connect_head(&mut reader).await?;
        if head.status == 200 {
            return Ok(());
        }

        let mut body = vec![0u8; head.body_budget.min(REFUSAL_BODY_CAP)];
        let mut filled = 0;
        while filled < body.len() {
            match reader.read(&mut body[filled..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
        body.truncate(filled);
        Err(DialError::ProxyRefused(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}

impl std::fmt::Debug for ProxyDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDialer")
            .field("scheme", &self.scheme)
            .field("proxy_addr", &self.proxy_addr)
            .field("has_customizer", &self.customizer.is_some())
            .finish()
    }
}

struct ConnectHead {
    status: u16,
    body_budget: usize,
}

/// Read just the head of the proxy's CONNECT response. A 200 carries no
/// body, so stopping at the blank line leaves the tunnel bytes untouched.
async fn read_connect_head<R>(reader: &mut R) -> Result<ConnectHead, DialError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut head = Vec::with_capacity(256);
    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(DialError::Frame(FrameError::UnexpectedEof));
        }
        if head.len() > 16 * 1024 {
            return Err(DialError::Frame(FrameError::HeadTooLarge));
        }
        let line = &head[start..];
        if (line == b"\r\n" || line == b"\n") && start > 0 {
            break;
        }
    }

    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut header_buf);
    match parsed.parse(&head).map_err(FrameError::from)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(DialError::Frame(FrameError::UnexpectedEof)),
    }

    let status = parsed
        .code
        .ok_or_else(|| DialError::Frame(FrameError::Parse("missing status code".into())))?;
    let body_budget = parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(REFUSAL_BODY_CAP);

    Ok(ConnectHead {
        status,
        body_budget,
    })
}

/// Dial `addr` directly or through the configured parent proxy.
pub(crate) async fn connect_dial(
    upstream: &Option<ProxyDialer>,
    addr: &str,
) -> Result<ProxyStream, DialError> {
    match upstream {
        Some(dialer) => dialer.dial(addr).await,
        None => Ok(ProxyStream::Plain(TcpStream::connect(addr).await?)),
    }
}

/// A tunnel to the origin: plain TCP, or TLS when the parent proxy itself
/// is reached over TLS.
pub enum ProxyStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ProxyStream {
    /// Recover the plain TCP stream for half-close splicing.
    pub(crate) fn into_plain(self) -> Result<TcpStream, ProxyStream> {
        match self {
            ProxyStream::Plain(tcp) => Ok(tcp),
            other => Err(other),
        }
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStream::Plain(_) => f.write_str("ProxyStream::Plain"),
            ProxyStream::Tls(_) => f.write_str("ProxyStream::Tls"),
        }
    }
}
