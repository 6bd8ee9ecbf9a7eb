//! Per-request proxy context
//!
//! One context per CONNECT, and a child per inner MITM request. Carries the
//! session ID every log line is tagged with, the certificate store handlers
//! may consult, and whatever state user code wants to thread through the
//! filter chains.

use crate::cert_cache::CertStore;
use crate::http1::HttpResponse;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

/// Negotiated TLS parameters of the origin leg, attached to the context
/// before response filters run.
#[derive(Debug, Clone)]
pub struct TlsSessionState {
    /// ALPN protocol the origin agreed to, if any.
    pub alpn_protocol: Option<Vec<u8>>,

    /// Negotiated protocol version.
    pub protocol_version: Option<rustls::ProtocolVersion>,
}

/// Per-request record handed to handlers and filters.
pub struct ProxyContext {
    /// Monotonically increasing session ID, unique per CONNECT and per
    /// MITM-inner request.
    pub session: i64,

    /// Authority named by the originating CONNECT request.
    pub authority: String,

    /// Remote address of the connecting client.
    pub remote_addr: Option<SocketAddr>,

    /// Opaque user state threaded through handler and filter chains.
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,

    /// Response a handler prepared for the Reject disposition.
    pub response: Option<HttpResponse>,

    /// Origin-leg TLS state, populated inside a TLS-MITM session.
    pub tls_state: Option<TlsSessionState>,

    cert_store: Option<Arc<dyn CertStore>>,
}

impl ProxyContext {
    pub(crate) fn new(
        session: i64,
        authority: String,
        remote_addr: Option<SocketAddr>,
        cert_store: Option<Arc<dyn CertStore>>,
    ) -> Self {
        Self {
            session,
            authority,
            remote_addr,
            user_data: None,
            response: None,
            tls_state: None,
            cert_store,
        }
    }

    /// Context for an inner MITM request: fresh session ID, carried user
    /// data, no inherited response or TLS state.
    pub(crate) fn child(&self, session: i64) -> Self {
        Self {
            session,
            authority: self.authority.clone(),
            remote_addr: self.remote_addr,
            user_data: self.user_data.clone(),
            response: None,
            tls_state: None,
            cert_store: self.cert_store.clone(),
        }
    }

    /// The certificate store minting is routed through.
    pub fn cert_store(&self) -> Option<&Arc<dyn CertStore>> {
        self.cert_store.as_ref()
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("session", &self.session)
            .field("authority", &self.authority)
            .field("remote_addr", &self.remote_addr)
            .field("has_user_data", &self.user_data.is_some())
            .field("has_response", &self.response.is_some())
            .field("tls_state", &self.tls_state)
            .finish()
    }
}
