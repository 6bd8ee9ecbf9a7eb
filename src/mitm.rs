//! TLS MITM terminator and per-request loop
//!
//! After the dispatcher answers `200 OK`, the tunnel turns into two TLS
//! sessions: one terminating the client under a minted leaf, one dialing the
//! true origin with a fingerprinted hello. The negotiated ALPN protocols are
//! reconciled across the legs, HTTP/2 is delegated to the external handler,
//! and HTTP/1.1 requests are read one at a time, filtered, round-tripped,
//! and re-framed to the client as chunked responses.

use crate::connect::{ConnectRequest, OriginTlsLeg};
use crate::context::{ProxyContext, TlsSessionState};
use crate::http1::{self, FrameError, HttpRequest, HttpResponse};
use crate::proxy::{write_http_error, MitmProxy};
use crate::tls::{
    self, default_alpn, fingerprint_for, has_port, origin_client_config, sanitize_alpn,
    strip_port, HelloFingerprint, TlsConfigFactory, TlsSetupError,
};
use crate::upstream::{connect_dial, DialError};
use crate::websocket::{self, is_websocket_upgrade};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Errors inside an established tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("cannot dial remote: {0}")]
    Dial(#[from] DialError),

    #[error("HTTP framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a TLS MITM session on a hijacked client connection. The dispatcher
/// has already written the `200 OK`; everything else happens here.
pub(crate) async fn serve_tls(
    proxy: Arc<MitmProxy>,
    connect_req: ConnectRequest,
    mut client: TcpStream,
    ctx: ProxyContext,
    factory: Option<TlsConfigFactory>,
    host: String,
) {
    let factory = factory.unwrap_or_else(|| proxy.default_tls_factory());
    let mut server_config = match factory(&host, &ctx) {
        Ok(config) => config,
        Err(e) => {
            warn!(session = ctx.session, host = %host, error = %e, "cannot sign host certificate");
            write_http_error(&mut client, &e).await;
            return;
        }
    };
    server_config.alpn_protocols = default_alpn();

    // HTTP/2 through a chained proxy is not supported; offer only h1 there.
    let origin_alpn = if proxy.upstream().is_some() {
        vec![b"http/1.1".to_vec()]
    } else {
        default_alpn()
    };

    let mut origin = match dial_origin(&proxy, &host, origin_alpn).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!(session = ctx.session, host = %host, error = %e, "cannot dial origin");
            // Placeholder handshake so the client hears the failure through
            // the TLS layer it expects.
            server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
            let acceptor = TlsAcceptor::from(Arc::new(server_config));
            match acceptor.accept(client).await {
                Ok(mut client_tls) => write_http_error(&mut client_tls, &e).await,
                Err(he) => warn!(session = ctx.session, error = %he, "placeholder handshake failed"),
            }
            return;
        }
    };

    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let mut client_tls = match acceptor.accept(client).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session = ctx.session, host = %host, error = %e, "cannot handshake mitm'd client");
            let _ = origin.shutdown().await;
            return;
        }
    };

    let client_proto = client_tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    let origin_proto = origin.get_ref().1.alpn_protocol().map(|p| p.to_vec());

    if client_proto != origin_proto {
        debug!(
            session = ctx.session,
            client = ?client_proto,
            origin = ?origin_proto,
            "ALPN mismatch between legs, redialing origin"
        );
        let _ = origin.shutdown().await;
        let redial_offer: Vec<Vec<u8>> = client_proto.iter().cloned().collect();
        origin = match dial_origin(&proxy, &host, redial_offer).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(session = ctx.session, host = %host, error = %e, "redial failed");
                write_http_error(&mut client_tls, &e).await;
                return;
            }
        };
    }

    let origin_state = TlsSessionState {
        alpn_protocol: origin.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        protocol_version: origin.get_ref().1.protocol_version(),
    };

    // HTTP/2 is delegated; a declined or absent handler degrades the
    // session to HTTP/1.1 over the fallback round-tripper.
    let mut fallback = None;
    if client_proto.as_deref() == Some(b"h2".as_slice()) {
        match proxy.http2_handler() {
            Some(handler) => {
                match handler(connect_req.clone(), client_tls, origin).await {
                    None => return,
                    Some((returned_client, returned_origin)) => {
                        warn!(session = ctx.session, "HTTP/2 handler declined, switching to http/1.1");
                        client_tls = returned_client;
                        origin = returned_origin;
                        fallback = Some(FallbackTransport::new(Arc::clone(&proxy), host.clone()));
                    }
                }
            }
            None => {
                warn!(session = ctx.session, "no HTTP/2 handler, switching to http/1.1");
                fallback = Some(FallbackTransport::new(Arc::clone(&proxy), host.clone()));
            }
        }
    }

    let mut client_buf = BufReader::new(client_tls);
    let mut origin_buf = BufReader::new(origin);

    loop {
        let request = match http1::read_request(&mut client_buf).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(session = ctx.session, "exiting on EOF");
                break;
            }
            Err(e) => {
                warn!(session = ctx.session, error = %e, "cannot read request from mitm'd client");
                break;
            }
        };

        // Remote Desktop Gateway tunnels its own protocol through what looks
        // like HTTP; from here on the bytes are opaque.
        if request.method.contains("RDG") {
            debug!(session = ctx.session, method = %request.method, "RDG method, splicing raw bytes");
            if let Err(e) = http1::write_request(&mut origin_buf, &request).await {
                warn!(session = ctx.session, error = %e, "cannot forward RDG request");
                break;
            }
            let mut client_raw = client_buf.into_inner();
            let mut origin_raw = origin_buf.into_inner();
            if let Err(e) = tokio::io::copy_bidirectional(&mut client_raw, &mut origin_raw).await {
                debug!(session = ctx.session, error = %e, "RDG splice ended");
            }
            let _ = client_raw.shutdown().await;
            let _ = origin_raw.shutdown().await;
            return;
        }

        let mut inner_ctx = ctx.child(proxy.next_session());

        let mut request = request;
        if !request.target.starts_with("https://") && !request.target.starts_with("http://") {
            request.target = format!("https://{}{}", connect_req.authority, request.target);
        }
        debug!(session = inner_ctx.session, method = %request.method, target = %request.target, "req");

        if is_websocket_upgrade(&request) {
            debug!(session = inner_ctx.session, "request looks like websocket upgrade");
            if let Err(e) = http1::write_request(&mut origin_buf, &request).await {
                warn!(session = inner_ctx.session, error = %e, "cannot forward websocket upgrade");
                write_http_error(&mut client_buf, &e).await;
                return;
            }
            websocket::pipe(client_buf.into_inner(), origin_buf.into_inner()).await;
            return;
        }

        let (request, synthesized) = proxy.apply_request_filters(request, &mut inner_ctx);

        let response = match synthesized {
            Some(response) => response,
            None => {
                let result = match &fallback {
                    Some(transport) => transport.round_trip(&request).await,
                    None => round_trip(&mut origin_buf, &request).await,
                };
                match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(session = inner_ctx.session, error = %e, "cannot read response from mitm'd server");
                        write_http_error(&mut client_buf, &e).await;
                        let _ = origin_buf.get_mut().shutdown().await;
                        return;
                    }
                }
            }
        };

        inner_ctx.tls_state = Some(origin_state.clone());
        let response = proxy.apply_response_filters(response, &mut inner_ctx);
        debug!(session = inner_ctx.session, status = response.status, "resp");

        if let Err(e) = http1::write_response_chunked(&mut client_buf, &response).await {
            warn!(session = inner_ctx.session, error = %e, "cannot write response to mitm'd client");
            break;
        }
    }

    let _ = client_buf.get_mut().shutdown().await;
    let _ = origin_buf.get_mut().shutdown().await;
}

/// Dial and handshake the origin with a sanitized ALPN offer and the
/// fingerprint it implies.
async fn dial_origin(
    proxy: &MitmProxy,
    host: &str,
    mut alpn: Vec<Vec<u8>>,
) -> Result<OriginTlsLeg, TunnelError> {
    sanitize_alpn(&mut alpn);
    let fingerprint = fingerprint_for(&alpn);

    let addr = if has_port(host) {
        host.to_string()
    } else {
        format!("{}:443", host)
    };

    let tcp = connect_dial(proxy.upstream(), &addr).await?;
    let config = origin_client_config(fingerprint, alpn, false, proxy.origin_roots());
    let name = tls::server_name(strip_port(host))?;
    let stream = TlsConnector::from(Arc::new(config)).connect(name, tcp).await?;
    Ok(stream)
}

/// One request/response exchange over the established origin connection.
async fn round_trip<S>(
    origin: &mut BufReader<S>,
    request: &HttpRequest,
) -> Result<HttpResponse, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    http1::write_request(origin, request).await?;
    Ok(http1::read_response(origin).await?)
}

/// Round-tripper for sessions degraded from h2: a fresh no-ALPN origin
/// connection per request, TLS 1.2 floor, verification off.
struct FallbackTransport {
    proxy: Arc<MitmProxy>,
    host: String,
}

impl FallbackTransport {
    fn new(proxy: Arc<MitmProxy>, host: String) -> Self {
        Self { proxy, host }
    }

    async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse, TunnelError> {
        let addr = if has_port(&self.host) {
            self.host.clone()
        } else {
            format!("{}:443", self.host)
        };

        let tcp = connect_dial(self.proxy.upstream(), &addr).await?;
        let config =
            origin_client_config(HelloFingerprint::RandomizedNoAlpn, Vec::new(), true, None);
        let name = tls::server_name(strip_port(&self.host))?;
        let stream = TlsConnector::from(Arc::new(config)).connect(name, tcp).await?;

        let mut stream = BufReader::new(stream);
        http1::write_request(&mut stream, request).await?;
        let response = http1::read_response(&mut stream).await?;
        let _ = stream.get_mut().shutdown().await;
        Ok(response)
    }
}
