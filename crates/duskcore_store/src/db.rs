//! `EncryptedStore` (C2): a SQLite pool behind a page-encryption key.
//!
//! `sqlx`'s bundled SQLite driver has no page-cipher hook, so "page
//! encryption" is realized as column-level AES-256-CBC+HMAC-SHA256 of every
//! sensitive blob under the vault's master key — the same self-describing,
//! version-tagged-blob convention the wire envelope uses (spec.md §6: "All
//! blobs are self-describing with a 1-byte version tag"), reusing
//! `duskcore_crypto::primitives` rather than adding a second cipher.
//!
//! The store is a process-wide singleton in the spec's source, modeled here
//! as an explicit handle instead (spec.md §9's "model as a process-owned
//! handle ... pass a reference into components rather than relying on
//! process-wide state"): construct one `Store`, clone it (cheap — the pool
//! and vault are both internally `Arc`'d) into every component that needs
//! persistence.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use zeroize::Zeroize;

use duskcore_crypto::primitives;
use duskcore_crypto::ratchet::Conversation;

use crate::error::StoreError;
use crate::models::{ConversationRow, IdentityRow, PreKeyRow};
use crate::vault::Vault;

const BLOB_VERSION: u8 = 1;

/// Central store handle. Cheap to clone (`SqlitePool` and `Vault` are both
/// `Arc`-backed); concurrent callers may share one clone across threads —
/// `sqlx::SqlitePool` serializes writes for us, matching spec.md §5's "the
/// store's own write-serialization protects C2 invariants; callers need not
/// hold additional locks for store-only work."
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    vault: Vault,
    last_error: std::sync::Arc<Mutex<Option<(i32, String)>>>,
}

impl Store {
    /// `init(key, path)`. Opens (creating if missing) the SQLite database at
    /// `db_path`, runs migrations, and hands `key` to the vault — `key` is
    /// zeroized in place once the vault has copied it (spec.md §4.2).
    pub async fn init(key: &mut [u8; 32], db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        crate::migrations::run(&pool).await?;

        let vault = Vault::new();
        vault.open(key).await;

        tracing::info!(path = %db_path.display(), "encrypted store opened");

        Ok(Self {
            pool,
            vault,
            last_error: std::sync::Arc::new(Mutex::new(None)),
        })
    }

    /// `close()`. Zeroizes the master key; the pool is dropped with `self`.
    pub async fn close(&self) {
        self.vault.close().await;
        tracing::info!("encrypted store closed");
    }

    pub async fn is_ready(&self) -> bool {
        self.vault.is_open().await
    }

    /// `getErrorInfo()` companion: the last error's numeric code and message,
    /// recorded by every fallible method below rather than thrown.
    pub fn last_error(&self) -> Option<(i32, String)> {
        self.last_error.lock().expect("last_error mutex poisoned").clone()
    }

    fn record<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(ref e) = result {
            *self.last_error.lock().expect("last_error mutex poisoned") =
                Some((e.code(), e.to_string()));
        }
        result
    }

    // ── Blob cipher (self-describing, version-tagged) ───────────────────

    async fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.vault
            .with_key(|key| {
                let iv_bytes = primitives::rand_bytes(16);
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&iv_bytes);
                let ct = primitives::aes_cbc_encrypt(key, &iv, plaintext)
                    .map_err(StoreError::Crypto)?;
                let mac = primitives::hmac_sha256(key, &ct).map_err(StoreError::Crypto)?;
                let mut out = Vec::with_capacity(1 + 16 + ct.len() + 8);
                out.push(BLOB_VERSION);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ct);
                out.extend_from_slice(&mac[..8]);
                Ok(out)
            })
            .await
    }

    async fn decrypt_blob(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() < 1 + 16 + 8 || blob[0] != BLOB_VERSION {
            return Err(StoreError::BadParams("malformed store blob".into()));
        }
        let (header, mac_tag) = blob.split_at(blob.len() - 8);
        let iv: [u8; 16] = header[1..17].try_into().unwrap();
        let ct = &header[17..];
        self.vault
            .with_key(|key| {
                let expected = primitives::hmac_sha256(key, ct).map_err(StoreError::Crypto)?;
                if expected[..8] != *mac_tag {
                    return Err(StoreError::BadParams("store blob authentication failed".into()));
                }
                primitives::aes_cbc_decrypt(key, &iv, ct).map_err(StoreError::Crypto)
            })
            .await
    }

    // ── Identity ──────────────────────────────────────────────────────────

    pub async fn load_identity(&self, user_name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let result: Result<Option<Vec<u8>>, StoreError> = async {
            let row: Option<IdentityRow> =
                sqlx::query_as("SELECT user_name, blob, created_at FROM identity WHERE user_name = ?")
                    .bind(user_name)
                    .fetch_optional(&self.pool)
                    .await?;
            match row {
                Some(r) => Ok(Some(self.decrypt_blob(&r.blob).await?)),
                None => Ok(None),
            }
        }
        .await;
        self.record(result)
    }

    pub async fn store_identity(&self, user_name: &str, secret_bytes: &[u8]) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            let blob = self.encrypt_blob(secret_bytes).await?;
            sqlx::query(
                "INSERT INTO identity (user_name, blob, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(user_name) DO UPDATE SET blob = excluded.blob",
            )
            .bind(user_name)
            .bind(blob)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    // ── Conversations ─────────────────────────────────────────────────────

    pub async fn has_conversation(
        &self,
        local_user: &str,
        remote_user: &str,
        remote_device: &str,
    ) -> Result<bool, StoreError> {
        let result: Result<bool, StoreError> = async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM conversations WHERE local_user = ? AND remote_user = ? AND remote_device = ?",
            )
            .bind(local_user)
            .bind(remote_user)
            .bind(remote_device)
            .fetch_one(&self.pool)
            .await?;
            Ok(count > 0)
        }
        .await;
        self.record(result)
    }

    pub async fn load_conversation(
        &self,
        local_user: &str,
        remote_user: &str,
        remote_device: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let result: Result<Option<Conversation>, StoreError> = async {
            let row: Option<ConversationRow> = sqlx::query_as(
                "SELECT local_user, remote_user, remote_device, blob, updated_at FROM conversations
                 WHERE local_user = ? AND remote_user = ? AND remote_device = ?",
            )
            .bind(local_user)
            .bind(remote_user)
            .bind(remote_device)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(r) => {
                    let plaintext = self.decrypt_blob(&r.blob).await?;
                    Ok(Some(serde_json::from_slice(&plaintext)?))
                }
                None => Ok(None),
            }
        }
        .await;
        self.record(result)
    }

    pub async fn store_conversation(&self, conv: &Conversation) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            let plaintext = serde_json::to_vec(conv)?;
            let blob = self.encrypt_blob(&plaintext).await?;
            sqlx::query(
                "INSERT INTO conversations (local_user, remote_user, remote_device, blob, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(local_user, remote_user, remote_device)
                 DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            )
            .bind(&conv.local_user)
            .bind(&conv.remote_user)
            .bind(&conv.remote_device)
            .bind(blob)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    pub async fn delete_conversation(
        &self,
        local_user: &str,
        remote_user: &str,
        remote_device: &str,
    ) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            sqlx::query(
                "DELETE FROM conversations WHERE local_user = ? AND remote_user = ? AND remote_device = ?",
            )
            .bind(local_user)
            .bind(remote_user)
            .bind(remote_device)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    pub async fn list_conversations_of(&self, local_user: &str) -> Result<Vec<Conversation>, StoreError> {
        let result: Result<Vec<Conversation>, StoreError> = async {
            let rows: Vec<ConversationRow> = sqlx::query_as(
                "SELECT local_user, remote_user, remote_device, blob, updated_at FROM conversations
                 WHERE local_user = ?",
            )
            .bind(local_user)
            .fetch_all(&self.pool)
            .await?;
            let mut out = Vec::with_capacity(rows.len());
            for r in rows {
                let plaintext = self.decrypt_blob(&r.blob).await?;
                out.push(serde_json::from_slice(&plaintext)?);
            }
            Ok(out)
        }
        .await;
        self.record(result)
    }

    // ── Pre-keys ──────────────────────────────────────────────────────────

    pub async fn store_pre_key(&self, id: u32, secret_keypair_bytes: &[u8]) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            let blob = self.encrypt_blob(secret_keypair_bytes).await?;
            sqlx::query("INSERT INTO pre_keys (id, blob) VALUES (?, ?)")
                .bind(id as i64)
                .bind(blob)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    pub async fn load_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>, StoreError> {
        let result: Result<Option<Vec<u8>>, StoreError> = async {
            let row: Option<PreKeyRow> = sqlx::query_as("SELECT id, blob FROM pre_keys WHERE id = ?")
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(r) => Ok(Some(self.decrypt_blob(&r.blob).await?)),
                None => Ok(None),
            }
        }
        .await;
        self.record(result)
    }

    /// Deletes the one-time pre-key `id`. Called inside the same logical
    /// transaction as the session write that consumed it (spec.md §4.3);
    /// callers wrap this and `store_conversation` in `Store::transaction`.
    pub async fn delete_pre_key(&self, id: u32) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            sqlx::query("DELETE FROM pre_keys WHERE id = ?")
                .bind(id as i64)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    pub async fn get_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        let result: Result<Vec<u32>, StoreError> = async {
            let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM pre_keys")
                .fetch_all(&self.pool)
                .await?;
            Ok(ids.into_iter().map(|i| i as u32).collect())
        }
        .await;
        self.record(result)
    }

    pub async fn get_pre_key_count(&self) -> Result<u64, StoreError> {
        let result: Result<u64, StoreError> = async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pre_keys")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
        .await;
        self.record(result)
    }

    /// Consume a pre-key and persist the responder's freshly bootstrapped
    /// session as a single SQL transaction (spec.md §4.3: "deletes it from
    /// the store in the same transaction as the resulting session write").
    pub async fn consume_pre_key_and_store_conversation(
        &self,
        pre_key_id: u32,
        conv: &Conversation,
    ) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            let plaintext = serde_json::to_vec(conv)?;
            let blob = self.encrypt_blob(&plaintext).await?;

            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM pre_keys WHERE id = ?")
                .bind(pre_key_id as i64)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO conversations (local_user, remote_user, remote_device, blob, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(local_user, remote_user, remote_device)
                 DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            )
            .bind(&conv.local_user)
            .bind(&conv.remote_user)
            .bind(&conv.remote_device)
            .bind(blob)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        self.record(result)
    }

    // ── Admin ─────────────────────────────────────────────────────────────

    /// `resetStore()`: wipes all non-identity tables (`resetaxodb` command
    /// surface, spec.md §6). Staged keys live inside each conversation's
    /// serialized blob, so wiping `conversations` already clears them.
    pub async fn reset_store(&self) -> Result<(), StoreError> {
        let result: Result<(), StoreError> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM conversations").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM pre_keys").execute(&mut *tx).await?;
            tx.commit().await?;
            tracing::warn!("store reset: all conversations (and their staged keys) and pre-keys wiped");
            Ok(())
        }
        .await;
        self.record(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duskcore_crypto::ratchet::{Conversation, EstablishmentHeader};
    use std::path::PathBuf;
    use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

    async fn fresh_store() -> (Store, PathBuf) {
        let path = PathBuf::from(format!("/tmp/duskcore-store-test-{}.db", uuid::Uuid::new_v4()));
        let mut key = [7u8; 32];
        let store = Store::init(&mut key, &path).await.expect("open store");
        (store, path)
    }

    fn cleanup(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn init_zeroizes_caller_key_buffer() {
        let path = PathBuf::from(format!("/tmp/duskcore-store-test-{}.db", uuid::Uuid::new_v4()));
        let mut key = [9u8; 32];
        let store = Store::init(&mut key, &path).await.unwrap();
        assert_eq!(key, [0u8; 32], "caller's key buffer must be zeroized after init");
        assert!(store.is_ready().await);
        cleanup(&path);
    }

    #[tokio::test]
    async fn conversation_roundtrip_is_encrypted_at_rest() {
        let (store, path) = fresh_store().await;

        let spk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let spk_pub = X25519Public::from(&spk);
        let conv = Conversation::new_as_initiator(
            "alice".into(),
            "bob".into(),
            "D1".into(),
            [1u8; 32],
            spk_pub,
            [2u8; 32],
            EstablishmentHeader {
                pre_key_id: 1,
                signed_pre_key_id: 2,
                sender_identity_pub: [3u8; 32],
                sender_ephemeral_base_pub: [4u8; 32],
            },
        );

        assert!(!store.has_conversation("alice", "bob", "D1").await.unwrap());
        store.store_conversation(&conv).await.unwrap();
        assert!(store.has_conversation("alice", "bob", "D1").await.unwrap());

        let raw: (Vec<u8>,) = sqlx::query_as("SELECT blob FROM conversations LIMIT 1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let raw_str = String::from_utf8_lossy(&raw.0);
        assert!(!raw_str.contains("alice"), "stored blob must not contain plaintext fields");

        let loaded = store.load_conversation("alice", "bob", "D1").await.unwrap().unwrap();
        assert_eq!(loaded.remote_user, "bob");

        store.delete_conversation("alice", "bob", "D1").await.unwrap();
        assert!(!store.has_conversation("alice", "bob", "D1").await.unwrap());

        cleanup(&path);
    }

    #[tokio::test]
    async fn pre_key_lifecycle_and_count() {
        let (store, path) = fresh_store().await;

        store.store_pre_key(42, b"keypair-bytes").await.unwrap();
        assert_eq!(store.get_pre_key_count().await.unwrap(), 1);
        assert_eq!(store.load_pre_key(42).await.unwrap().unwrap(), b"keypair-bytes");

        store.delete_pre_key(42).await.unwrap();
        assert_eq!(store.get_pre_key_count().await.unwrap(), 0);
        assert!(store.load_pre_key(42).await.unwrap().is_none());

        cleanup(&path);
    }

    #[tokio::test]
    async fn reset_store_wipes_everything_but_identity() {
        let (store, path) = fresh_store().await;

        store.store_identity("alice", b"secret").await.unwrap();
        store.store_pre_key(1, b"pk").await.unwrap();

        store.reset_store().await.unwrap();

        assert_eq!(store.get_pre_key_count().await.unwrap(), 0);
        assert!(store.load_identity("alice").await.unwrap().is_some(), "identity survives reset");

        cleanup(&path);
    }

    #[tokio::test]
    async fn operations_after_close_fail_not_ready() {
        let (store, path) = fresh_store().await;
        store.close().await;
        assert!(!store.is_ready().await);

        let err = store.store_pre_key(1, b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotReady));
        assert!(store.last_error().is_some());

        cleanup(&path);
    }
}
