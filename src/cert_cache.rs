//! Certificate cache with single-flight minting
//!
//! Minting a leaf means generating a 2048-bit RSA key, so concurrent MITM
//! starts to the same host must not mint redundantly. The store hands out a
//! per-key slot; the slot lock serializes producers so at most one runs per
//! hostname while the rest wait and reuse its result.
//!
//! The store is per-proxy state injected through the request context, never
//! a process global, so tests can install a fresh one per run.

use crate::signer::{SignError, TlsIdentity};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Producer invoked on cache miss.
pub type CertProducer<'a> = &'a dyn Fn() -> Result<TlsIdentity, SignError>;

/// A hostname-keyed certificate store.
///
/// Implementations must guarantee single-flight per key: at most one
/// concurrent `producer` invocation per hostname. An entry returned for a
/// hostname must cover that hostname.
pub trait CertStore: Send + Sync {
    /// Return the cached identity for `host`, minting via `producer` on miss.
    fn fetch(&self, host: &str, producer: CertProducer<'_>) -> Result<TlsIdentity, SignError>;
}

type Slot = Arc<Mutex<Option<TlsIdentity>>>;

/// Built-in store: unbounded by default, optionally LRU-bounded.
///
/// Keyed by the queried hostname; the producer mints for exactly that
/// hostname, so an entry can never cover less than its key.
pub struct InMemoryCertStore {
    slots: Mutex<LruCache<String, Slot>>,
}

impl InMemoryCertStore {
    /// Unbounded store (leaves are retained for the process lifetime).
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Bounded store evicting least-recently-fetched hostnames.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of cached hostnames.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("cert store poisoned").len()
    }

    /// True when nothing has been minted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all cached identities (CA rotation, tests).
    pub fn clear(&self) {
        self.slots.lock().expect("cert store poisoned").clear();
    }
}

impl Default for InMemoryCertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CertStore for InMemoryCertStore {
    fn fetch(&self, host: &str, producer: CertProducer<'_>) -> Result<TlsIdentity, SignError> {
        // Grab or create the slot under the map lock, then release it so
        // other hostnames can proceed while this one mints.
        let slot = {
            let mut slots = self.slots.lock().expect("cert store poisoned");
            match slots.get(host) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot: Slot = Arc::new(Mutex::new(None));
                    slots.put(host.to_string(), Arc::clone(&slot));
                    slot
                }
            }
        };

        let mut entry = slot.lock().expect("cert slot poisoned");
        if let Some(identity) = entry.as_ref() {
            return Ok(identity.clone());
        }

        let identity = producer()?;
        *entry = Some(identity.clone());
        Ok(identity)
    }
}
