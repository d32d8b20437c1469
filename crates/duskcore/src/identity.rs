//! Identity & pre-key manager (C3, spec.md §4.3).
//!
//! Orchestrates `duskcore_crypto::identity` (keypair generation, signing)
//! and `duskcore_store` (persistence) — the teacher's `dl_crypto::identity`
//! already carries a `DeviceKeyPair`/`DeviceCert`/`DeviceCapabilities`
//! sub-system for per-device signing keys and capability-scoped
//! certificates; this spec's `Device` is just an opaque `(userName,
//! deviceId)` token, so that subsystem has no counterpart here.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use duskcore_crypto::identity::IdentityKeyPair;
use duskcore_crypto::x3dh;
use duskcore_store::Store;

use crate::error::CoreError;

/// Whether `IdentityManager::init` found an existing identity or minted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityInitResult {
    Created,
    Existing,
}

/// The small bundle persisted as the identity row's plaintext payload
/// (the store's own AES-256-CBC+HMAC column cipher then encrypts this blob
/// wholesale — there is no second layer of crypto here).
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    identity_secret: [u8; 32],
    signed_pre_key_id: u32,
    signed_pre_key_secret: [u8; 32],
}

pub struct IdentityManager {
    store: Store,
    user_name: String,
    identity: IdentityKeyPair,
    signed_pre_key_id: u32,
    signed_pre_key_secret: StaticSecret,
    signed_pre_key_pub: X25519Public,
    signed_pre_key_sig: Vec<u8>,
}

impl IdentityManager {
    /// Loads the local identity conversation; if absent, generates a fresh
    /// Curve25519-capable Ed25519 identity plus an initial signed pre-key,
    /// and persists both.
    pub async fn init(store: Store, user_name: String) -> Result<(Self, IdentityInitResult), CoreError> {
        if let Some(bytes) = store.load_identity(&user_name).await? {
            let stored: StoredIdentity = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let identity = IdentityKeyPair::from_bytes(&stored.identity_secret)?;
            let signed_pre_key_secret = StaticSecret::from(stored.signed_pre_key_secret);
            let signed_pre_key_pub = X25519Public::from(&signed_pre_key_secret);
            let signed_pre_key_sig = identity.sign(signed_pre_key_pub.as_bytes());
            let mgr = Self {
                store,
                user_name,
                identity,
                signed_pre_key_id: stored.signed_pre_key_id,
                signed_pre_key_secret,
                signed_pre_key_pub,
                signed_pre_key_sig,
            };
            tracing::info!(user = %mgr.user_name, "loaded existing identity");
            return Ok((mgr, IdentityInitResult::Existing));
        }

        let identity = IdentityKeyPair::generate()?;
        let (signed_pre_key_secret, signed_pre_key_pub, signed_pre_key_sig) =
            x3dh::generate_signed_prekey(&identity)?;
        let signed_pre_key_id = rand::rngs::OsRng.next_u32() & 0x7FFF_FFFF;

        let stored = StoredIdentity {
            identity_secret: *identity.secret_bytes(),
            signed_pre_key_id,
            signed_pre_key_secret: signed_pre_key_secret.to_bytes(),
        };
        let blob = serde_json::to_vec(&stored).map_err(|e| CoreError::Internal(e.to_string()))?;
        store.store_identity(&user_name, &blob).await?;

        let mgr = Self {
            store,
            user_name,
            identity,
            signed_pre_key_id,
            signed_pre_key_secret,
            signed_pre_key_pub,
            signed_pre_key_sig,
        };
        tracing::info!(user = %mgr.user_name, "created new identity");
        Ok((mgr, IdentityInitResult::Created))
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    pub fn signed_pre_key_pub(&self) -> X25519Public {
        self.signed_pre_key_pub
    }

    pub fn signed_pre_key_secret(&self) -> &StaticSecret {
        &self.signed_pre_key_secret
    }

    pub fn signed_pre_key_sig(&self) -> &[u8] {
        &self.signed_pre_key_sig
    }

    /// `newPreKeys(n)`: generate `n` one-time X25519 keypairs with ids drawn
    /// uniformly from `[1, 2^31)`, skipping collisions with ids already on
    /// record, and persist the secret halves.
    pub async fn new_prekeys(&self, n: usize) -> Result<Vec<(u32, X25519Public)>, CoreError> {
        let existing: std::collections::HashSet<u32> =
            self.store.get_pre_key_ids().await?.into_iter().collect();

        let mut out = Vec::with_capacity(n);
        let mut taken = existing;
        for (secret, public) in x3dh::generate_one_time_prekeys(n) {
            let id = loop {
                let candidate = rand::rngs::OsRng.next_u32() & 0x7FFF_FFFF;
                if candidate != 0 && !taken.contains(&candidate) {
                    taken.insert(candidate);
                    break candidate;
                }
            };
            self.store.store_pre_key(id, &secret.to_bytes()).await?;
            out.push((id, public));
        }
        Ok(out)
    }

    /// `getNumPreKeys()`.
    pub async fn get_num_prekeys(&self) -> Result<u64, CoreError> {
        Ok(self.store.get_pre_key_count().await?)
    }

    /// Looks up and decodes a one-time pre-key's secret half. Does not
    /// delete it — deletion happens transactionally alongside the session
    /// write in `establish::SessionEstablisher`.
    pub async fn load_prekey_secret(&self, id: u32) -> Result<Option<StaticSecret>, CoreError> {
        match self.store.load_pre_key(id).await? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| CoreError::Internal("stored pre-key has wrong length".into()))?;
                Ok(Some(StaticSecret::from(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
