//! Row models for the three core tables (spec.md §6). Staged (skipped)
//! message keys have no table of their own — they live embedded in each
//! `Conversation`'s serialized blob and ride along with it.
//!
//! Every blob column holds a self-describing, version-tagged ciphertext
//! produced by `db::encrypt_blob` — the serialized `Conversation` /
//! `PreKey` payload, AES-256-CBC+HMAC encrypted under the vault's master
//! key, never plaintext at rest.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct IdentityRow {
    pub user_name: String,
    /// Encrypted, versioned blob of the local `IdentityKeyPair` secret bytes.
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub local_user: String,
    pub remote_user: String,
    pub remote_device: String,
    /// Encrypted, versioned blob of the serialized `Conversation`.
    pub blob: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PreKeyRow {
    pub id: i64,
    /// Encrypted, versioned blob of the one-time pre-key's X25519 keypair.
    pub blob: Vec<u8>,
}
