//! Master-key holder for the encrypted store.
//!
//! spec.md §4.2: the store is opened with a caller-supplied 32-byte key; the
//! key is zeroed in memory immediately after the page-cipher (here, the
//! column-level AES-256-CBC+HMAC cipher in `db.rs`) has consumed it, and the
//! caller's own buffer is overwritten too. There is no password/auto-lock
//! layer in this spec — that host-UX concern belongs to the app binding, not
//! the core — so this module keeps only the teacher's `RwLock`-guarded
//! zeroize-on-drop shape, dropping the Argon2 password derivation and
//! inactivity timer.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct MasterKey([u8; 32]);

/// Thread-safe handle to the store's 256-bit master key. Cheap to clone
/// (`Arc` internally); every clone observes the same open/closed state.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<MasterKey>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)) }
    }

    /// `init(key, ...)`: take ownership of the caller's key material and
    /// zero their buffer. Re-initializing an already-open vault replaces the
    /// key (the old one is zeroized on drop).
    pub async fn open(&self, key: &mut [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(MasterKey(*key));
        key.zeroize();
    }

    /// `close()`: zeroize and drop the key.
    pub async fn close(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Access the raw key for an encrypt/decrypt operation. Errs with
    /// `StoreError::NotReady` if the vault has never been opened.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(k) => f(&k.0),
            None => Err(StoreError::NotReady),
        }
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}
