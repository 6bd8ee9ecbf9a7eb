//! CONNECT dispositions and handler contracts
//!
//! Handlers inspect the CONNECT authority and pick one of six tunnel modes;
//! the first handler returning an action wins and may rewrite the host the
//! tunnel targets.

use crate::context::ProxyContext;
use crate::tls::TlsConfigFactory;
use crate::upstream::ProxyStream;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Boxed future used by the async callback contracts.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The client leg of a MITM session after TLS termination.
pub type ClientTlsLeg = tokio_rustls::server::TlsStream<TcpStream>;

/// The origin leg of a MITM session.
pub type OriginTlsLeg = tokio_rustls::client::TlsStream<ProxyStream>;

/// The hijacked CONNECT request, as handed over by the outer HTTP server.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Request authority (`host:port`).
    pub authority: String,

    /// Remote address of the connecting client.
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectRequest {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

/// Callback taking over a hijacked client connection.
///
/// For [`ConnectAction::ProxyAuthHijack`] the status line written before the
/// callback runs has NO terminating blank line: the callback is expected to
/// complete the header block (typically with a `Proxy-Authenticate`
/// challenge) before anything else.
pub type HijackFn =
    Arc<dyn Fn(ConnectRequest, TcpStream, ProxyContext) -> BoxFuture<()> + Send + Sync>;

/// External HTTP/2 handler, consulted when the MITM client leg negotiates
/// `h2`. Returning `None` means the handler consumed both connections and
/// the tunnel task is done; returning the streams back declines, and the
/// proxy falls back to HTTP/1.1 with its fallback round-tripper.
pub type Http2Handler = Arc<
    dyn Fn(
            ConnectRequest,
            ClientTlsLeg,
            OriginTlsLeg,
        ) -> BoxFuture<Option<(ClientTlsLeg, OriginTlsLeg)>>
        + Send
        + Sync,
>;

/// Disposition of a CONNECT request.
#[derive(Clone)]
pub enum ConnectAction {
    /// Blind tunnel: dial the target and splice bytes both ways.
    Accept,

    /// Write the context's prepared response (if any) and close.
    Reject,

    /// Terminate TLS with a minted certificate and inspect requests. The
    /// factory overrides the proxy-wide default when present.
    MitmTls {
        tls: Option<TlsConfigFactory>,
    },

    /// Treat the tunnel as plaintext HTTP and inspect requests.
    MitmHttp,

    /// Answer `200 OK` and hand the raw client connection to the callback.
    Hijack(HijackFn),

    /// Answer with an unterminated `407` status line and hand the client
    /// connection to the callback; see [`HijackFn`].
    ProxyAuthHijack(HijackFn),
}

impl ConnectAction {
    /// TLS MITM with the proxy-wide default certificate factory.
    pub fn mitm_tls() -> Self {
        ConnectAction::MitmTls { tls: None }
    }

    /// TLS MITM with a custom certificate factory.
    pub fn mitm_tls_with(tls: TlsConfigFactory) -> Self {
        ConnectAction::MitmTls { tls: Some(tls) }
    }
}

impl std::fmt::Debug for ConnectAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectAction::Accept => "Accept",
            ConnectAction::Reject => "Reject",
            ConnectAction::MitmTls { .. } => "MitmTls",
            ConnectAction::MitmHttp => "MitmHttp",
            ConnectAction::Hijack(_) => "Hijack",
            ConnectAction::ProxyAuthHijack(_) => "ProxyAuthHijack",
        };
        f.write_str(name)
    }
}

/// A link in the CONNECT handler chain.
///
/// Returning `None` abstains and passes the decision to the next handler;
/// the returned host replaces the tunnel target when the handler decides.
pub trait ConnectHandler: Send + Sync {
    fn handle_connect(
        &self,
        host: &str,
        ctx: &mut ProxyContext,
    ) -> (Option<ConnectAction>, String);
}

impl<F> ConnectHandler for F
where
    F: Fn(&str, &mut ProxyContext) -> (Option<ConnectAction>, String) + Send + Sync,
{
    fn handle_connect(
        &self,
        host: &str,
        ctx: &mut ProxyContext,
    ) -> (Option<ConnectAction>, String) {
        self(host, ctx)
    }
}
