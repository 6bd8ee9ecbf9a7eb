//! Shared helpers for integration tests
#![allow(dead_code)]

use interpose::{CertificateAuthority, TlsIdentity};
use rcgen::{Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// A test CA: the parsed authority plus its PEMs and DER for trust setup.
pub struct TestCa {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCa {
    /// Fast ECDSA CA, fine wherever bit-determinism is not under test.
    pub fn generate(common_name: &str) -> Self {
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();

        Self { cert_pem, key_pem }
    }

    pub fn authority(&self) -> CertificateAuthority {
        CertificateAuthority::from_pem(&self.cert_pem, &self.key_pem).unwrap()
    }

    /// Root store trusting only this CA.
    pub fn root_store(&self) -> RootCertStore {
        let authority = self.authority();
        let mut roots = RootCertStore::empty();
        roots.add(authority.ca_der().clone()).unwrap();
        roots
    }

    /// Client config trusting only this CA, with no ALPN offer.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(self.root_store())
                .with_no_client_auth(),
        )
    }
}

/// TLS server config presenting `identity`, offering no ALPN.
pub fn server_config(identity: &TlsIdentity) -> Arc<ServerConfig> {
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.chain.clone(), identity.key.clone_key())
            .unwrap(),
    )
}

/// Wire test logging to the `RUST_LOG` filter; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A connected loopback TCP pair.
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    (connect.await.unwrap(), accepted)
}

/// Server name for TLS client handshakes in tests.
pub fn sni(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_owned()).unwrap()
}
