//! Identity key management.
//!
//! Exactly one long-term `IdentityKeyPair` (Ed25519) per installed instance
//! (spec.md §3 "Identity"): created on first init, immutable thereafter. It
//! both signs published pre-keys and — via the birational Ed25519→X25519
//! conversion in `x3dh` — participates in X3DH Diffie-Hellman. The spec's
//! `Device` entity carries no keypair of its own; it is just an opaque
//! `(userName, deviceId)` token (see `duskcore::identity::DeviceId`), so this
//! module has no device-certificate subsystem.
//!
//! Prekeys
//! -------
//! - Signed Prekey (SPK): X25519, public half signed by the identity key.
//! - One-Time Prekeys (OPK): X25519, consumed once per session init,
//!   never re-served (spec.md §3 "PreKey").

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier as _, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes (160 bits), hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    ///
    /// 160 bits provides strong collision resistance for manual verification.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Numeric fingerprint for QR codes: 12 groups of 5 digits (60 digits).
    /// Derived from BLAKE3 hash, matching Signal's safety number format.
    pub fn numeric_fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let bytes = hash.as_bytes();
        let mut groups = Vec::with_capacity(12);
        for i in 0..12 {
            // Take 2.5 bytes (20 bits) per group, mod 100000
            let offset = i * 5 / 2;
            let val = if i % 2 == 0 {
                ((bytes[offset] as u32) << 12)
                    | ((bytes[offset + 1] as u32) << 4)
                    | ((bytes[offset + 2] as u32) >> 4)
            } else {
                (((bytes[offset] & 0x0F) as u32) << 16)
                    | ((bytes[offset + 1] as u32) << 8)
                    | (bytes[offset + 2] as u32)
            };
            groups.push(format!("{:05}", val % 100_000));
        }
        groups.join(" ")
    }

    /// Compare two fingerprints for verification.
    /// Returns true if both keys produce the same fingerprint.
    pub fn fingerprints_match(&self, other: &PublicKeyBytes) -> bool {
        // Constant-time comparison of the full hash to prevent timing leaks
        let h1 = blake3::hash(&self.0);
        let h2 = blake3::hash(&other.0);
        let mut diff = 0u8;
        for (a, b) in h1.as_bytes().iter().zip(h2.as_bytes().iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        let secret_bytes = signing_key.to_bytes();
        Ok(Self { public, secret_bytes })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity key must be 32 bytes, got {}", bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign arbitrary bytes; returns 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    /// Convert this Ed25519 key's public half to X25519 for DH operations.
    /// Used in X3DH when the identity key participates in key agreement.
    pub fn to_x25519_public(&self) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let ed_pub: [u8; 32] = self.public.0.clone().try_into()
            .map_err(|_| CryptoError::InvalidKey("public key not 32 bytes".into()))?;
        crate::x3dh::ed25519_pub_to_x25519(&ed_pub)
    }

    /// Export the public key in base64 format for server upload.
    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrip_sign_verify() {
        let id = IdentityKeyPair::generate().unwrap();
        let sig = id.sign(b"a signed pre-key");
        IdentityKeyPair::verify(&id.public.0, b"a signed pre-key", &sig).unwrap();
    }

    #[test]
    fn identity_survives_byte_roundtrip() {
        let id = IdentityKeyPair::generate().unwrap();
        let restored = IdentityKeyPair::from_bytes(id.secret_bytes()).unwrap();
        assert_eq!(id.public, restored.public);
    }

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let a = IdentityKeyPair::generate().unwrap().public;
        let b = IdentityKeyPair::generate().unwrap().public;
        assert_eq!(a.fingerprint(), a.fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(!a.fingerprints_match(&b));
        assert!(a.fingerprints_match(&a.clone()));
    }
}
