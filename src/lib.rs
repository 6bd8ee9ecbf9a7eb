//! Interpose - interactive MITM HTTP/HTTPS proxy core
//!
//! Interpose is the CONNECT-tunnel heart of an intercepting forward proxy:
//! it takes hijacked client connections after an HTTP CONNECT, decides a
//! disposition through a user handler chain, and either splices bytes
//! blindly or terminates TLS under an on-the-fly minted certificate so every
//! request and response can be inspected and rewritten in flight.
//!
//! ## Features
//!
//! - **Six tunnel modes**: blind accept, reject, TLS MITM, plaintext-HTTP
//!   MITM, custom hijack, and proxy-auth hijack
//! - **Deterministic certificate minting**: leaves are reproducible bit for
//!   bit from the CA key and hostname set, cached with single-flight
//! - **ALPN reconciliation**: `h2` vs `http/1.1` negotiated to match on both
//!   legs, with HTTP/2 delegated to an external handler
//! - **Chained proxies**: tunnels can ride an upstream proxy taken from
//!   `HTTPS_PROXY`
//! - **WebSocket & RDG pass-through**: upgrades and Remote Desktop Gateway
//!   sessions degrade into transparent byte pipes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use interpose::{ConnectAction, ConnectRequest, MitmProxy};
//! use interpose::CertificateAuthority;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = CertificateAuthority::from_pem(
//!         &std::fs::read_to_string("ca-cert.pem")?,
//!         &std::fs::read_to_string("ca-key.pem")?,
//!     )?;
//!
//!     let proxy = MitmProxy::builder(ca)
//!         .with_connect_handler(|host: &str, _ctx: &mut interpose::ProxyContext| {
//!             (Some(ConnectAction::mitm_tls()), host.to_string())
//!         })
//!         .build();
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     loop {
//!         let (client, addr) = listener.accept().await?;
//!         // ... parse the CONNECT head off `client`, then:
//!         let request = ConnectRequest::new("example.com:443").with_remote_addr(addr);
//!         proxy.serve_connect(client, request);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - `signer` / `csprng` / `cert_cache` - deterministic leaf minting
//! - `tls` - impersonating server configs and fingerprinted origin clients
//! - `proxy` / `connect` - CONNECT dispatcher and handler contracts
//! - `mitm` - TLS terminator and per-request inspection loop
//! - `http1` - wire-level HTTP/1.1 framing
//! - `upstream` - chained-proxy dialing
//! - `relay` / `websocket` - byte splicing and upgrade pass-through
//!
//! The outer HTTP server that accepts CONNECT requests, the filter bodies,
//! and the HTTP/2 handler are the embedder's business; Interpose only drives
//! the tunnels.

pub mod cert_cache;
pub mod connect;
pub mod context;
pub mod csprng;
pub mod http1;
pub mod signer;
pub mod tls;
pub mod upstream;
pub mod websocket;

// Dispatcher and tunnel internals
pub mod proxy;

mod mitm;
mod relay;

// Re-export commonly used types

/// Certificate minting
pub use signer::{CertificateAuthority, SignError, TlsIdentity};

/// Certificate caching
pub use cert_cache::{CertStore, InMemoryCertStore};

/// CONNECT dispositions
pub use connect::{
    BoxFuture, ClientTlsLeg, ConnectAction, ConnectHandler, ConnectRequest, HijackFn,
    Http2Handler, OriginTlsLeg,
};

/// Per-request context
pub use context::{ProxyContext, TlsSessionState};

/// HTTP messages seen by filters
pub use http1::{HttpRequest, HttpResponse};

/// The proxy core
pub use proxy::{MitmProxy, MitmProxyBuilder, RequestFilter, ResponseFilter};

/// TLS configuration
pub use tls::{strip_port, tls_config_from_ca, HelloFingerprint, TlsConfigFactory, TlsSetupError};

/// Tunnel errors
pub use mitm::TunnelError;

/// Upstream proxy dialing
pub use upstream::{ConnectCustomizer, DialError, ProxyDialer, ProxyStream};

/// WebSocket pass-through
pub use websocket::{bridge_websocket, bridge_websocket_tls, is_websocket_upgrade, BridgeError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "interpose");
    }
}
