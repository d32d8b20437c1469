//! duskcore_store — encrypted local persistence (C2).
//!
//! # Encryption strategy
//! `sqlx`'s bundled SQLite driver has no page-cipher hook, so encryption is
//! applied at the column level instead: every sensitive blob (identity
//! secret, serialized `Conversation`, staged message key, pre-key keypair)
//! is AES-256-CBC encrypted and HMAC-SHA256 authenticated under the vault's
//! master key before it reaches SQLite, using the same self-describing,
//! version-tagged-blob convention as the wire envelope. Non-sensitive
//! metadata (user/device identifiers, timestamps) stays in plaintext
//! columns so the store can still index and query by them.
//!
//! # Migration
//! `sqlx::migrate!` runs the bundled `migrations/` directory on every
//! `Store::init`.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use vault::Vault;
