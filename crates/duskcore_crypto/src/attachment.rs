//! SCloud: chunked symmetric encryption for large attachment blobs.
//!
//! spec.md §4.9. Grounded in `aead.rs` (the teacher's XChaCha20-Poly1305
//! wrapper, reused here for per-segment encryption) plus SHA-256 for the
//! content-addressed locator — the spec is explicit about SHA-256 for the
//! locator even though the teacher's own `attachment_hash` (dropped, see
//! DESIGN.md) used BLAKE3.
//!
//! A random 512-bit content key `K` is generated per attachment. `K` splits
//! into a 32-byte AEAD key and a 16-byte nonce base; each segment's nonce is
//! the base concatenated with its big-endian `u64` index, so no nonce is ever
//! reused for a given `K`. The locator is the SHA-256 of the full ciphertext
//! stream (all segments, in order), matching spec.md's "SHA-256 of
//! ciphertext"; it is readable at any point but only final once encryption
//! completes.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::aead;
use crate::error::CryptoError;

pub const CONTENT_KEY_LEN: usize = 64;
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// The random content key wrapped for inclusion in the outgoing message
/// (`getKeyBLOB`). Self-describing: a 1-byte version tag followed by the raw
/// 64 bytes.
pub fn wrap_content_key(key: &ContentKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + CONTENT_KEY_LEN);
    out.push(1u8);
    out.extend_from_slice(&key.0);
    out
}

pub fn unwrap_content_key(blob: &[u8]) -> Result<ContentKey, CryptoError> {
    if blob.len() != 1 + CONTENT_KEY_LEN || blob[0] != 1 {
        return Err(CryptoError::InvalidKey("bad attachment key blob".into()));
    }
    let mut raw = [0u8; CONTENT_KEY_LEN];
    raw.copy_from_slice(&blob[1..]);
    Ok(ContentKey(raw))
}

#[derive(Clone)]
pub struct ContentKey([u8; CONTENT_KEY_LEN]);

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl ContentKey {
    pub fn generate() -> Self {
        let mut raw = [0u8; CONTENT_KEY_LEN];
        raw.copy_from_slice(&crate::primitives::rand_bytes(CONTENT_KEY_LEN));
        Self(raw)
    }

    /// `calculateKey`: derive the AEAD key and per-segment nonce base from K.
    fn segmentation_params(&self) -> ([u8; 32], [u8; 16]) {
        let mut enc_key = [0u8; 32];
        enc_key.copy_from_slice(&self.0[0..32]);
        let mut nonce_base = [0u8; 16];
        nonce_base.copy_from_slice(&self.0[32..48]);
        (enc_key, nonce_base)
    }
}

fn segment_nonce(nonce_base: &[u8; 16], index: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(nonce_base);
    nonce[16..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// A per-segment key packet the caller can hand to a transport that fetches
/// segments independently (`getSegmentBLOB`).
#[derive(Debug, Clone)]
pub struct SegmentBlob {
    pub index: u64,
    pub nonce: [u8; 24],
    pub ciphertext_len: u32,
}

// ── Encrypt side ──────────────────────────────────────────────────────────────

pub struct AttachmentEncryptor {
    key: ContentKey,
    enc_key: [u8; 32],
    nonce_base: [u8; 16],
    plaintext: Vec<u8>,
    segment_size: usize,
    next_index: u64,
    offset: usize,
    locator_hasher: Sha256,
    segments_emitted: Vec<SegmentBlob>,
    pub meta: Vec<u8>,
}

impl AttachmentEncryptor {
    /// `encryptNew(context, data, meta)`: generate a random content key and
    /// stage `data` for chunked encryption.
    pub fn encrypt_new(data: Vec<u8>, meta: Vec<u8>) -> Self {
        let key = ContentKey::generate();
        let (enc_key, nonce_base) = key.segmentation_params();
        Self {
            key,
            enc_key,
            nonce_base,
            plaintext: data,
            segment_size: DEFAULT_SEGMENT_SIZE,
            next_index: 0,
            offset: 0,
            locator_hasher: Sha256::new(),
            segments_emitted: Vec::new(),
            meta,
        }
    }

    /// `getKeyBLOB(handle)`: the content key wrapped for inclusion in the
    /// outgoing message.
    pub fn get_key_blob(&self) -> Vec<u8> {
        wrap_content_key(&self.key)
    }

    /// Remaining unencrypted bytes; `encrypt_next` should be called until
    /// this returns 0.
    pub fn buffer_size(&self) -> usize {
        self.plaintext.len() - self.offset
    }

    /// `getSegmentBLOB(handle, n)`: the key packet for segment `n`, if it has
    /// already been produced by `encrypt_next`.
    pub fn get_segment_blob(&self, n: usize) -> Option<&SegmentBlob> {
        self.segments_emitted.get(n)
    }

    /// `encryptNext(handle) -> segmentCiphertext`.
    pub fn encrypt_next(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.buffer_size() == 0 {
            return Ok(Vec::new());
        }
        let end = (self.offset + self.segment_size).min(self.plaintext.len());
        let chunk = &self.plaintext[self.offset..end];
        self.offset = end;

        let nonce = segment_nonce(&self.nonce_base, self.next_index);
        let ciphertext = aead::encrypt_with_nonce(&self.enc_key, &nonce, chunk, b"duskcore-attachment-v1")?;
        self.locator_hasher.update(&ciphertext);
        self.segments_emitted.push(SegmentBlob {
            index: self.next_index,
            nonce,
            ciphertext_len: ciphertext.len() as u32,
        });
        self.next_index += 1;
        Ok(ciphertext)
    }

    /// `getLocator(handle)`: SHA-256 of the ciphertext emitted so far, raw bytes.
    pub fn get_locator(&self) -> [u8; 32] {
        self.locator_hasher.clone().finalize().into()
    }

    /// `getLocatorREST(handle)`: the same digest, lower-hex encoded for use in
    /// a REST path segment.
    pub fn get_locator_rest(&self) -> String {
        hex::encode(self.get_locator())
    }

    /// Explicit `free`; Rust's `Drop` already zeroizes key material, but the
    /// method is kept for callers ported from the original C-shaped API.
    pub fn free(self) {}
}

// ── Decrypt side ──────────────────────────────────────────────────────────────

pub struct AttachmentDecryptor {
    enc_key: [u8; 32],
    nonce_base: [u8; 16],
    next_index: u64,
    plaintext: Vec<u8>,
    meta: Vec<u8>,
}

impl AttachmentDecryptor {
    /// `decryptNew(K)`.
    pub fn decrypt_new(key: &ContentKey, meta: Vec<u8>) -> Self {
        let (enc_key, nonce_base) = key.segmentation_params();
        Self {
            enc_key,
            nonce_base,
            next_index: 0,
            plaintext: Vec::new(),
            meta,
        }
    }

    /// `decryptNext`: feed the next ciphertext segment, in order.
    pub fn decrypt_next(&mut self, segment_ciphertext: &[u8]) -> Result<(), CryptoError> {
        let nonce = segment_nonce(&self.nonce_base, self.next_index);
        let pt = aead::decrypt_with_nonce(&self.enc_key, &nonce, segment_ciphertext, b"duskcore-attachment-v1")?;
        self.plaintext.extend_from_slice(&pt);
        self.next_index += 1;
        Ok(())
    }

    /// `getDecryptedData`: full reassembled plaintext plus the meta blob
    /// supplied at `decrypt_new`.
    pub fn get_decrypted_data(&self) -> (&[u8], &[u8]) {
        (&self.plaintext, &self.meta)
    }

    pub fn free(self) {}
}

impl Drop for AttachmentEncryptor {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.nonce_base.zeroize();
    }
}

impl Drop for AttachmentDecryptor {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.nonce_base.zeroize();
    }
}

/// Wipe the content key's plaintext bytes right after unwrapping, matching
/// the manual-zeroization convention applied throughout (§5).
pub fn zeroize_blob(blob: &mut Vec<u8>) {
    let z = Zeroizing::new(std::mem::take(blob));
    drop(z);
}
