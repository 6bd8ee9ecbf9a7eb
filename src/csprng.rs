//! Deterministic counter-mode byte stream
//!
//! Leaf certificates must come out bit-identical across runs, so the RSA key
//! generator cannot draw from the OS. Instead it draws from an AES-256-CTR
//! keystream keyed by the CA private key and seeded by the hostname hash:
//! same CA, same hosts, same key.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Errors constructing the deterministic stream
#[derive(Debug, Error)]
pub enum CsprngError {
    #[error("empty CA key material")]
    EmptyKeyMaterial,
}

/// Deterministic pseudorandom stream: AES-256-CTR keystream over zeros.
///
/// Key = SHA-256 of the CA private key DER; IV = first 16 bytes of the seed,
/// zero-padded. The stream is a pure function of `(key material, seed)`.
pub struct CounterRng {
    cipher: Aes256Ctr,
}

impl CounterRng {
    /// Build the stream from CA key material and a seed (the hostname hash).
    pub fn new(key_material: &[u8], seed: &[u8]) -> Result<Self, CsprngError> {
        if key_material.is_empty() {
            return Err(CsprngError::EmptyKeyMaterial);
        }

        let key = Sha256::digest(key_material);

        let mut iv = [0u8; 16];
        let take = seed.len().min(16);
        iv[..take].copy_from_slice(&seed[..take]);

        Ok(Self {
            cipher: Aes256Ctr::new(&key, &iv.into()),
        })
    }
}

impl RngCore for CounterRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_be_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_be_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        // CTR over an all-zero buffer yields the raw keystream.
        dest.fill(0);
        self.cipher.apply_keystream(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

// The stream is as strong as the CA key's secrecy, which is already the
// trust anchor of the whole proxy.
impl CryptoRng for CounterRng {}
