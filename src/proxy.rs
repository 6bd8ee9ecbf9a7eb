//! MitmProxy - CONNECT dispatcher and proxy-wide state
//!
//! The outer HTTP server hands each hijacked CONNECT connection to
//! [`MitmProxy::serve_connect`], which runs the handler chain and drives the
//! chosen tunnel mode in its own task so the accept loop never blocks on a
//! long-lived tunnel.

use crate::cert_cache::{CertStore, InMemoryCertStore};
use crate::connect::{ConnectAction, ConnectHandler, ConnectRequest, Http2Handler};
use crate::context::ProxyContext;
use crate::http1::{self, HttpRequest, HttpResponse};
use crate::mitm;
use crate::relay::{splice_half_close, splice_joined};
use crate::signer::CertificateAuthority;
use crate::tls::{has_port, tls_config_from_ca, TlsConfigFactory};
use crate::upstream::{connect_dial, ProxyDialer};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request filter: may rewrite the request and/or synthesize a response,
/// which skips the origin round-trip.
pub type RequestFilter = Arc<
    dyn Fn(HttpRequest, &mut ProxyContext) -> (HttpRequest, Option<HttpResponse>) + Send + Sync,
>;

/// Response filter: rewrites the response before it is written back.
pub type ResponseFilter =
    Arc<dyn Fn(HttpResponse, &mut ProxyContext) -> HttpResponse + Send + Sync>;

/// The MITM proxy core.
pub struct MitmProxy {
    ca: Arc<CertificateAuthority>,
    handlers: Vec<Arc<dyn ConnectHandler>>,
    request_filters: Vec<RequestFilter>,
    response_filters: Vec<ResponseFilter>,
    cert_store: Arc<dyn CertStore>,
    upstream: Option<ProxyDialer>,
    http2_handler: Option<Http2Handler>,
    origin_roots: Option<Arc<rustls::RootCertStore>>,
    tls_factory: TlsConfigFactory,
    sessions: AtomicI64,
}

impl MitmProxy {
    /// Start building a proxy around a CA.
    pub fn builder(ca: CertificateAuthority) -> MitmProxyBuilder {
        MitmProxyBuilder {
            ca,
            handlers: Vec::new(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            cert_store: None,
            upstream: None,
            http2_handler: None,
            origin_roots: None,
        }
    }

    /// The CA leaves are minted from.
    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Handle one hijacked CONNECT connection in a dedicated task.
    pub fn serve_connect(
        self: &Arc<Self>,
        client: TcpStream,
        request: ConnectRequest,
    ) -> JoinHandle<()> {
        let proxy = Arc::clone(self);
        tokio::spawn(async move { proxy.dispatch(client, request).await })
    }

    async fn dispatch(self: Arc<Self>, mut client: TcpStream, request: ConnectRequest) {
        let mut ctx = self.new_context(&request);
        debug!(
            session = ctx.session,
            host = %request.authority,
            handlers = self.handlers.len(),
            "running CONNECT handlers"
        );

        let mut action = ConnectAction::Accept;
        let mut host = request.authority.clone();
        for (idx, handler) in self.handlers.iter().enumerate() {
            let (decision, new_host) = handler.handle_connect(&host, &mut ctx);
            if let Some(decision) = decision {
                debug!(session = ctx.session, handler = idx, action = ?decision, host = %new_host, "handler decided");
                action = decision;
                host = new_host;
                break;
            }
        }

        match action {
            ConnectAction::Accept => self.accept_tunnel(client, host, ctx).await,
            ConnectAction::Reject => reject(client, ctx).await,
            ConnectAction::Hijack(hijack) => {
                debug!(session = ctx.session, host = %host, "hijacking CONNECT");
                if let Err(e) = client.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await {
                    warn!(session = ctx.session, error = %e, "cannot answer hijacked CONNECT");
                    return;
                }
                hijack(request, client, ctx).await;
            }
            ConnectAction::ProxyAuthHijack(hijack) => {
                // Deliberately unterminated: the callback completes the
                // header block with its challenge.
                if let Err(e) = client
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n")
                    .await
                {
                    warn!(session = ctx.session, error = %e, "cannot answer CONNECT with 407");
                    return;
                }
                hijack(request, client, ctx).await;
            }
            ConnectAction::MitmHttp => {
                debug!(session = ctx.session, host = %host, "assuming CONNECT is plain HTTP, mitm proxying it");
                self.mitm_http(client, host, ctx).await;
            }
            ConnectAction::MitmTls { tls } => {
                debug!(session = ctx.session, host = %host, "assuming CONNECT is TLS, mitm proxying it");
                if let Err(e) = client.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await {
                    warn!(session = ctx.session, error = %e, "cannot answer CONNECT");
                    return;
                }
                mitm::serve_tls(Arc::clone(&self), request, client, ctx, tls, host).await;
            }
        }
    }

    /// Blind tunnel: dial, answer 200, splice.
    async fn accept_tunnel(&self, mut client: TcpStream, host: String, ctx: ProxyContext) {
        let host = if has_port(&host) {
            host
        } else {
            format!("{}:80", host)
        };

        let origin = match connect_dial(&self.upstream, &host).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(session = ctx.session, host = %host, error = %e, "cannot dial CONNECT target");
                write_http_error(&mut client, &e).await;
                return;
            }
        };

        info!(session = ctx.session, host = %host, "accepting CONNECT");
        if let Err(e) = client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await {
            warn!(session = ctx.session, error = %e, "cannot answer CONNECT");
            return;
        }

        match origin.into_plain() {
            Ok(tcp) => splice_half_close(client, tcp).await,
            Err(stream) => splice_joined(client, stream).await,
        }
    }

    /// Plaintext HTTP MITM: per-request loop without TLS termination.
    async fn mitm_http(&self, mut client: TcpStream, host: String, ctx: ProxyContext) {
        if let Err(e) = client.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await {
            warn!(session = ctx.session, error = %e, "cannot answer CONNECT");
            return;
        }

        let origin = match connect_dial(&self.upstream, &host).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(session = ctx.session, host = %host, error = %e, "error dialing mitm'd host");
                return;
            }
        };

        let mut client_buf = BufReader::new(client);
        let mut origin_buf = BufReader::new(origin);

        loop {
            let request = match http1::read_request(&mut client_buf).await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    warn!(session = ctx.session, error = %e, "cannot read request of MITM HTTP client");
                    return;
                }
            };

            let mut inner_ctx = ctx.child(self.next_session());
            let (request, synthesized) = self.apply_request_filters(request, &mut inner_ctx);

            let response = match synthesized {
                Some(response) => response,
                None => {
                    let exchange = async {
                        http1::write_request(&mut origin_buf, &request).await?;
                        http1::read_response(&mut origin_buf).await
                    };
                    match exchange.await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(session = inner_ctx.session, error = %e, "mitm'd HTTP exchange failed");
                            write_http_error(&mut client_buf, &e).await;
                            return;
                        }
                    }
                }
            };

            let response = self.apply_response_filters(response, &mut inner_ctx);
            if let Err(e) = http1::write_response(&mut client_buf, &response).await {
                warn!(session = inner_ctx.session, error = %e, "cannot write response to MITM HTTP client");
                return;
            }
        }
    }

    pub(crate) fn next_session(&self) -> i64 {
        self.sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn new_context(&self, request: &ConnectRequest) -> ProxyContext {
        ProxyContext::new(
            self.next_session(),
            request.authority.clone(),
            request.remote_addr,
            Some(Arc::clone(&self.cert_store)),
        )
    }

    pub(crate) fn upstream(&self) -> &Option<ProxyDialer> {
        &self.upstream
    }

    pub(crate) fn http2_handler(&self) -> Option<&Http2Handler> {
        self.http2_handler.as_ref()
    }

    pub(crate) fn origin_roots(&self) -> Option<Arc<rustls::RootCertStore>> {
        self.origin_roots.clone()
    }

    pub(crate) fn default_tls_factory(&self) -> TlsConfigFactory {
        Arc::clone(&self.tls_factory)
    }

    pub(crate) fn apply_request_filters(
        &self,
        request: HttpRequest,
        ctx: &mut ProxyContext,
    ) -> (HttpRequest, Option<HttpResponse>) {
        let mut request = request;
        for filter in &self.request_filters {
            let (filtered, response) = filter(request, ctx);
            request = filtered;
            if response.is_some() {
                return (request, response);
            }
        }
        (request, None)
    }

    pub(crate) fn apply_response_filters(
        &self,
        response: HttpResponse,
        ctx: &mut ProxyContext,
    ) -> HttpResponse {
        let mut response = response;
        for filter in &self.response_filters {
            response = filter(response, ctx);
        }
        response
    }
}

/// Write the raw `500` wire error and close the connection.
pub(crate) async fn write_http_error<W>(writer: &mut W, error: &(dyn std::fmt::Display + Send + Sync))
where
    W: AsyncWrite + Unpin,
{
    let message = format!("HTTP/1.1 500 Server error\r\n\r\n{}\r\n", error);
    if let Err(e) = writer.write_all(message.as_bytes()).await {
        warn!(error = %e, "error responding to client");
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn reject(mut client: TcpStream, ctx: ProxyContext) {
    debug!(session = ctx.session, host = %ctx.authority, "rejecting CONNECT");
    if let Some(response) = &ctx.response {
        if let Err(e) = http1::write_response(&mut client, response).await {
            warn!(session = ctx.session, error = %e, "cannot write response that rejects CONNECT");
        }
    }
    let _ = client.shutdown().await;
}

/// Builder for [`MitmProxy`].
pub struct MitmProxyBuilder {
    ca: CertificateAuthority,
    handlers: Vec<Arc<dyn ConnectHandler>>,
    request_filters: Vec<RequestFilter>,
    response_filters: Vec<ResponseFilter>,
    cert_store: Option<Arc<dyn CertStore>>,
    upstream: Option<ProxyDialer>,
    http2_handler: Option<Http2Handler>,
    origin_roots: Option<Arc<rustls::RootCertStore>>,
}

impl MitmProxyBuilder {
    /// Append a CONNECT handler; the first one to decide wins.
    pub fn with_connect_handler<H>(mut self, handler: H) -> Self
    where
        H: ConnectHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Append a request filter.
    pub fn with_request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(HttpRequest, &mut ProxyContext) -> (HttpRequest, Option<HttpResponse>)
            + Send
            + Sync
            + 'static,
    {
        self.request_filters.push(Arc::new(filter));
        self
    }

    /// Append a response filter.
    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(HttpResponse, &mut ProxyContext) -> HttpResponse + Send + Sync + 'static,
    {
        self.response_filters.push(Arc::new(filter));
        self
    }

    /// Install a certificate store (defaults to an unbounded in-memory one).
    pub fn with_cert_store(mut self, store: Arc<dyn CertStore>) -> Self {
        self.cert_store = Some(store);
        self
    }

    /// Route tunnels through a parent proxy.
    pub fn with_upstream(mut self, dialer: ProxyDialer) -> Self {
        self.upstream = Some(dialer);
        self
    }

    /// Route tunnels through the proxy named by `HTTPS_PROXY`/`https_proxy`,
    /// when set.
    pub fn with_upstream_from_env(mut self) -> Self {
        self.upstream = ProxyDialer::from_env();
        self
    }

    /// Install the external HTTP/2 handler.
    pub fn with_http2_handler(mut self, handler: Http2Handler) -> Self {
        self.http2_handler = Some(handler);
        self
    }

    /// Trust these roots for origin connections instead of the webpki
    /// bundle (private or test origin CAs).
    pub fn with_origin_root_store(mut self, roots: rustls::RootCertStore) -> Self {
        self.origin_roots = Some(Arc::new(roots));
        self
    }

    pub fn build(self) -> Arc<MitmProxy> {
        let ca = Arc::new(self.ca);
        let tls_factory = tls_config_from_ca(Arc::clone(&ca));
        let cert_store = self
            .cert_store
            .unwrap_or_else(|| Arc::new(InMemoryCertStore::new()));
        Arc::new(MitmProxy {
            ca,
            handlers: self.handlers,
            request_filters: self.request_filters,
            response_filters: self.response_filters,
            cert_store,
            upstream: self.upstream,
            http2_handler: self.http2_handler,
            origin_roots: self.origin_roots,
            tls_factory,
            sessions: AtomicI64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{Certificate, CertificateParams, DnType, IsCa, KeyPair};
    use std::collections::HashSet;

    fn test_ca() -> CertificateAuthority {
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "interpose test CA");
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap()
    }

    #[test]
    fn test_session_ids_form_contiguous_range() {
        let proxy = MitmProxy::builder(test_ca()).build();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let proxy = Arc::clone(&proxy);
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| proxy.next_session()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id >= 1);
                assert!(seen.insert(id), "duplicate session id {}", id);
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(*seen.iter().max().unwrap(), 800);
    }

    #[test]
    fn test_request_filters_short_circuit_on_synthesized_response() {
        let proxy = MitmProxy::builder(test_ca())
            .with_request_filter(|req, _ctx| {
                let resp = HttpResponse::new(403, "Forbidden", b"blocked".to_vec());
                (req, Some(resp))
            })
            .with_request_filter(|_req, _ctx| panic!("second filter must not run"))
            .build();

        let mut ctx = proxy.new_context(&ConnectRequest::new("example.com:443"));
        let request = HttpRequest {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: 1,
            headers: Vec::new(),
            body: Vec::new(),
        };

        let (_, synthesized) = proxy.apply_request_filters(request, &mut ctx);
        assert_eq!(synthesized.unwrap().status, 403);
    }

    #[test]
    fn test_response_filters_chain_in_order() {
        let proxy = MitmProxy::builder(test_ca())
            .with_response_filter(|mut resp, _ctx| {
                resp.body.extend_from_slice(b"-one");
                resp
            })
            .with_response_filter(|mut resp, _ctx| {
                resp.body.extend_from_slice(b"-two");
                resp
            })
            .build();

        let mut ctx = proxy.new_context(&ConnectRequest::new("example.com:443"));
        let response = HttpResponse::new(200, "OK", b"base".to_vec());
        let filtered = proxy.apply_response_filters(response, &mut ctx);
        assert_eq!(filtered.body, b"base-one-two");
    }
}
