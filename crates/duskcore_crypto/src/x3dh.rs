//! X3DH-like asynchronous key agreement primitives.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!
//! This module only holds the pieces of X3DH that are identity-key shaped
//! rather than session-shaped: the Ed25519→X25519 birational conversion
//! used to reuse the long-term identity keypair for Diffie-Hellman, and
//! signed/one-time prekey generation. The DH1..DH4 computation and HKDF
//! root-key derivation live in `duskcore::establish` instead, against the
//! raw 32-byte establishment-block types the wire envelope actually carries
//! (spec.md §6) rather than a base64-JSON bundle.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, identity::IdentityKeyPair};

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// This uses the clamped SHA-512 expansion that ed25519-dalek uses internally,
/// mirroring libsignal's approach to IK → X25519 conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the user's Ed25519 identity key.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
) -> Result<(StaticSecret, X25519Public, Vec<u8>), CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    Ok((secret, public, sig))
}

/// Generate a batch of one-time prekeys (X25519).
/// Returns Vec<(secret, public)>.
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_to_x25519_conversion_is_deterministic_and_dh_agrees() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let alice_x_secret = ed25519_secret_to_x25519(alice_ik.secret_bytes());
        let alice_ed_pub: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let alice_x_pub = ed25519_pub_to_x25519(&alice_ed_pub).unwrap();
        assert_eq!(X25519Public::from(&alice_x_secret), alice_x_pub);

        let bob_x_secret = ed25519_secret_to_x25519(bob_ik.secret_bytes());
        let bob_ed_pub: [u8; 32] = bob_ik.public.0.clone().try_into().unwrap();
        let bob_x_pub = ed25519_pub_to_x25519(&bob_ed_pub).unwrap();

        let shared_a = alice_x_secret.diffie_hellman(&bob_x_pub);
        let shared_b = bob_x_secret.diffie_hellman(&alice_x_pub);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn signed_prekey_signature_verifies_against_identity() {
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (_secret, public, sig) = generate_signed_prekey(&bob_ik).unwrap();
        let bob_ed_pub: [u8; 32] = bob_ik.public.0.clone().try_into().unwrap();
        IdentityKeyPair::verify(&bob_ed_pub, public.as_bytes(), &sig).unwrap();
    }

    #[test]
    fn one_time_prekeys_are_distinct() {
        let batch = generate_one_time_prekeys(4);
        assert_eq!(batch.len(), 4);
        for i in 0..batch.len() {
            for j in (i + 1)..batch.len() {
                assert_ne!(batch[i].1.as_bytes(), batch[j].1.as_bytes());
            }
        }
    }
}
