//! duskcore_crypto — cryptographic primitives and protocol state for the
//! duskcore end-to-end encrypted messaging core.
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`    — long-term Ed25519 identity keypair (signs pre-keys, also
//!                   usable as an X25519 DH key via birational conversion)
//! - `x3dh`        — asynchronous key agreement over a published pre-key bundle
//! - `ratchet`     — the Double Ratchet: `Conversation` session state plus the
//!                   encrypt/decrypt key-derivation chain
//! - `attachment`  — chunked symmetric encryption for large blobs (SCloud)
//! - `primitives`  — X25519, HMAC-SHA256, HKDF, AES-256-CBC/PKCS#7, CSPRNG
//! - `aead`        — XChaCha20-Poly1305 helpers, reused by `attachment`
//! - `error`       — unified error type

pub mod aead;
pub mod attachment;
pub mod error;
pub mod identity;
pub mod primitives;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
