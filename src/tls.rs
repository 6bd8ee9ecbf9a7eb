//! TLS configuration - impersonating server configs and origin-facing clients
//!
//! The server side presents a freshly minted leaf for whatever host the
//! CONNECT named; the client side dials the true origin with a fingerprint
//! policy controlling the ClientHello shape (ALPN offer, protocol floor,
//! verification). Configs are built per connection and frozen behind `Arc`
//! before any handshake; ALPN changes always build a new config.

use crate::context::ProxyContext;
use crate::signer::{CertificateAuthority, SignError, TlsIdentity};
use rustls::pki_types::ServerName;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS setup errors
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("certificate signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Per-connection factory for the client-facing (impersonating) TLS config.
pub type TlsConfigFactory =
    Arc<dyn Fn(&str, &ProxyContext) -> Result<ServerConfig, TlsSetupError> + Send + Sync>;

/// ClientHello shape used when dialing the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelloFingerprint {
    /// Browser-like hello: full ALPN offer, TLS 1.2+, verified chain.
    #[default]
    ChromeAuto,

    /// No ALPN extension at all; used when the offer would not lead with
    /// `h2`, and (with verification disabled) for the HTTP/1.1 fallback
    /// round-tripper.
    RandomizedNoAlpn,
}

/// Default ALPN offer on both legs of a MITM session.
pub(crate) fn default_alpn() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Build the default factory: sign for the port-stripped host through the
/// context's certificate store.
pub fn tls_config_from_ca(ca: Arc<CertificateAuthority>) -> TlsConfigFactory {
    Arc::new(move |host, ctx| {
        let hostname = strip_port(host).to_string();
        debug!(session = ctx.session, host = %hostname, "signing for host");

        let produce = || ca.sign_host(std::slice::from_ref(&hostname));
        let identity = match ctx.cert_store() {
            Some(store) => store.fetch(&hostname, &produce)?,
            None => produce()?,
        };

        server_config_with_identity(&identity)
    })
}

/// Server config presenting a minted identity. ALPN is left for the caller.
pub(crate) fn server_config_with_identity(
    identity: &TlsIdentity,
) -> Result<ServerConfig, TlsSetupError> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(|e| TlsSetupError::Config(e.to_string()))
}

/// Origin-facing client config for the given fingerprint. `roots` replaces
/// the webpki bundle when the operator trusts private origin CAs.
pub(crate) fn origin_client_config(
    fingerprint: HelloFingerprint,
    mut alpn: Vec<Vec<u8>>,
    insecure: bool,
    roots: Option<Arc<RootCertStore>>,
) -> ClientConfig {
    let roots = match roots {
        Some(roots) => roots.as_ref().clone(),
        None => webpki_root_store(),
    };
    let mut config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();

    if matches!(fingerprint, HelloFingerprint::RandomizedNoAlpn) {
        alpn.clear();
    }
    config.alpn_protocols = alpn;

    if insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    config
}

/// Client config used for chained-proxy TLS and plaintext WebSocket bridges.
pub(crate) fn webpki_client_config() -> ClientConfig {
    ClientConfig::builder()
        .with_root_certificates(webpki_root_store())
        .with_no_client_auth()
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Reset an ALPN offer whose entries could not have come from an HTTP
/// client: every protocol must start with `h`.
pub(crate) fn sanitize_alpn(offer: &mut Vec<Vec<u8>>) {
    let invalid = offer.iter().any(|proto| proto.first() != Some(&b'h'));
    if invalid {
        warn!(offer = ?offer, "invalid ALPN offer, resetting to defaults");
        *offer = default_alpn();
    }
}

/// Pick the hello shape for an offer: anything not leading with `h2` dials
/// without an ALPN extension.
pub(crate) fn fingerprint_for(offer: &[Vec<u8>]) -> HelloFingerprint {
    match offer.first() {
        Some(first) if first != b"h2" => HelloFingerprint::RandomizedNoAlpn,
        _ => HelloFingerprint::ChromeAuto,
    }
}

/// Parse a hostname into an SNI server name.
pub(crate) fn server_name(hostname: &str) -> Result<ServerName<'static>, TlsSetupError> {
    ServerName::try_from(hostname.to_owned())
        .map_err(|e| TlsSetupError::InvalidServerName(e.to_string()))
}

/// Drop the port from a CONNECT authority. Bracketed IPv6 literals lose
/// their brackets so the result parses as an address.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host.rfind(':') {
        Some(idx)
            if !host[idx + 1..].is_empty()
                && host[idx + 1..].bytes().all(|b| b.is_ascii_digit())
                && !host[..idx].contains(':') =>
        {
            &host[..idx]
        }
        _ => host,
    }
}

/// True when the authority already names a port.
pub(crate) fn has_port(host: &str) -> bool {
    if let Some(end) = host.rfind(']') {
        return host[end + 1..].starts_with(':');
    }
    match host.rfind(':') {
        Some(idx) => {
            !host[idx + 1..].is_empty()
                && host[idx + 1..].bytes().all(|b| b.is_ascii_digit())
                && !host[..idx].contains(':')
        }
        None => false,
    }
}

/// Certificate verifier that accepts anything; only installed on the
/// HTTP/1.1 fallback round-tripper, which talks to origins the proxy has
/// already decided to impersonate.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
