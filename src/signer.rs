//! Certificate signer - deterministic leaf minting for impersonated origins
//!
//! The signer parses the operator's CA once at startup and then mints one
//! leaf certificate per hostname set. Minting is deterministic: the hostname
//! hash seeds a counter-mode stream derived from the CA key, the leaf RSA
//! key is drawn from that stream, and the serial number is the hash itself.
//! Re-running the proxy against the same CA reproduces the same leaf bytes,
//! which keeps pinning setups and golden tests stable.

use crate::csprng::CounterRng;
use rcgen::{
    Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Bumped whenever minted certificates become incompatible with earlier
/// releases; feeds the hostname hash so old cache entries don't collide.
const SIGNER_VERSION: &str = ":interpose1";

/// Runtime tag hashed alongside the hostnames, mirroring the signer version.
const RUNTIME_TAG: &str = concat!(":", env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Subject organization stamped into every leaf. Deliberately loud so an
/// inspected certificate is recognizable as an interception artifact.
const LEAF_ORGANIZATION: &str = "Interpose untrusted MITM proxy Inc";

/// 2049-12-31T00:00:00Z, the fixed end of every leaf's validity window.
const NOT_AFTER_DAYS_FROM_EPOCH: i64 = 29_219;

/// Leaf RSA modulus size in bits.
const LEAF_KEY_BITS: usize = 2048;

/// Signing errors
#[derive(Debug, Error)]
pub enum SignError {
    #[error("CA certificate parse failed: {0}")]
    CaParse(String),

    #[error("unsupported CA key: {0}")]
    UnsupportedKey(String),

    #[error("leaf key generation failed: {0}")]
    KeyGen(String),

    #[error("certificate signing failed: {0}")]
    CertSign(String),

    #[error("empty hostname list")]
    EmptyHostList,
}

/// A minted leaf: DER chain `[leaf, ca]` plus the leaf private key.
pub struct TlsIdentity {
    /// Certificate chain presented to clients, leaf first.
    pub chain: Vec<CertificateDer<'static>>,

    /// Leaf private key (PKCS#8).
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// The operator's certificate authority, parsed once at startup.
///
/// Holds the rcgen issuer used for signing, the original CA DER returned as
/// the chain tail, and the CA key DER that seeds the deterministic stream.
pub struct CertificateAuthority {
    issuer: Certificate,
    ca_der: CertificateDer<'static>,
    ca_key_der: Vec<u8>,
}

impl CertificateAuthority {
    /// Parse the CA certificate and private key from PEM. Fails fast: a
    /// proxy without a working CA must not start.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SignError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| SignError::UnsupportedKey(e.to_string()))?;
        let ca_key_der = key_pair.serialize_der();

        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| SignError::CaParse(e.to_string()))?;
        let issuer =
            Certificate::from_params(params).map_err(|e| SignError::CaParse(e.to_string()))?;

        let ca_der = parse_ca_der(cert_pem)?;

        Ok(Self {
            issuer,
            ca_der: CertificateDer::from(ca_der),
            ca_key_der,
        })
    }

    /// CA certificate DER (safe to expose; this is what clients must trust).
    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    /// Mint a leaf certificate covering `hosts`.
    ///
    /// Every entry lands in the SAN list: IP literals (bracketed IPv6
    /// included) as IP addresses, everything else as DNS names, with the
    /// CommonName set to the last DNS name seen. Output is bit-identical
    /// across runs for the same `(CA key, hostname set)` when the CA key is
    /// RSA; ECDSA CA signatures are randomized by the underlying signer.
    pub fn sign_host(&self, hosts: &[String]) -> Result<TlsIdentity, SignError> {
        if hosts.is_empty() {
            return Err(SignError::EmptyHostList);
        }

        let hash = host_set_hash(hosts);
        debug!(hosts = ?hosts, "signing leaf certificate");

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.serial_number = Some(SerialNumber::from_slice(&hash));
        params.not_before = OffsetDateTime::UNIX_EPOCH;
        params.not_after = OffsetDateTime::UNIX_EPOCH + Duration::days(NOT_AFTER_DAYS_FROM_EPOCH);
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;
        params
            .distinguished_name
            .push(DnType::OrganizationName, LEAF_ORGANIZATION);

        params.subject_alt_names = Vec::with_capacity(hosts.len());
        let mut common_name = None;
        for host in hosts {
            match parse_ip_literal(host) {
                Some(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
                None => {
                    params
                        .subject_alt_names
                        .push(SanType::DnsName(host.clone()));
                    // Last DNS entry wins.
                    common_name = Some(host);
                }
            }
        }
        if let Some(host) = common_name {
            params
                .distinguished_name
                .push(DnType::CommonName, host.clone());
        }

        let mut rng = CounterRng::new(&self.ca_key_der, &hash)
            .map_err(|e| SignError::KeyGen(e.to_string()))?;
        let leaf_key = RsaPrivateKey::new(&mut rng, LEAF_KEY_BITS)
            .map_err(|e| SignError::KeyGen(e.to_string()))?;
        let key_der = leaf_key
            .to_pkcs8_der()
            .map_err(|e| SignError::KeyGen(e.to_string()))?;

        params.key_pair = Some(
            KeyPair::from_der_and_sign_algo(key_der.as_bytes(), &rcgen::PKCS_RSA_SHA256)
                .map_err(|e| SignError::KeyGen(e.to_string()))?,
        );

        let leaf =
            Certificate::from_params(params).map_err(|e| SignError::CertSign(e.to_string()))?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.issuer)
            .map_err(|e| SignError::CertSign(e.to_string()))?;

        Ok(TlsIdentity {
            chain: vec![CertificateDer::from(leaf_der), self.ca_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec())),
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_der_len", &self.ca_der.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// Hash of the sorted hostname set plus version tags. Doubles as the leaf
/// serial number and the CSPRNG seed.
fn host_set_hash(hosts: &[String]) -> [u8; 20] {
    let mut entries: Vec<&str> = hosts.iter().map(String::as_str).collect();
    entries.push(SIGNER_VERSION);
    entries.push(RUNTIME_TAG);
    entries.sort_unstable();

    let mut hasher = Sha1::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b",");
    }
    hasher.finalize().into()
}

/// Parse an IP literal, accepting bracketed IPv6 (`[::1]`).
fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}

/// Extract the CA DER from PEM and sanity-check the CA bit.
fn parse_ca_der(cert_pem: &str) -> Result<Vec<u8>, SignError> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| SignError::CaParse(format!("PEM parse failed: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| SignError::CaParse(format!("X.509 parse failed: {}", e)))?;

    match cert.basic_constraints() {
        Ok(Some(bc)) if bc.value.ca => {}
        Ok(_) => warn!("CA certificate does not carry basicConstraints CA=true"),
        Err(e) => return Err(SignError::CaParse(format!("bad basicConstraints: {}", e))),
    }

    Ok(pem.contents)
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_host_set_hash_is_order_insensitive() {
        let a = host_set_hash(&["a.example.com".into(), "b.example.com".into()]);
        let b = host_set_hash(&["b.example.com".into(), "a.example.com".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_set_hash_differs_per_set() {
        let a = host_set_hash(&["a.example.com".into()]);
        let b = host_set_hash(&["b.example.com".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_host_list_is_an_error() {
        let ca = test_ca();
        assert!(matches!(
            ca.sign_host(&[]),
            Err(SignError::EmptyHostList)
        ));
    }

    #[test]
    fn test_ip_literal_parsing() {
        assert!(parse_ip_literal("192.168.1.1").is_some());
        assert!(parse_ip_literal("[::1]").is_some());
        assert!(parse_ip_literal("::1").is_some());
        assert!(parse_ip_literal("example.com").is_none());
    }

    #[test]
    fn test_sign_host_returns_leaf_and_ca() {
        let ca = test_ca();
        let identity = ca.sign_host(&["example.com".to_string()]).unwrap();
        assert_eq!(identity.chain.len(), 2);
        assert_eq!(identity.chain[1], *ca.ca_der());
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        assert!(matches!(
            CertificateAuthority::from_pem("not a cert", "not a key"),
            Err(SignError::UnsupportedKey(_))
        ));
    }
}
