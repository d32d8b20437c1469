//! duskcore_proto — wire envelope codec and provisioning-client JSON schema.
//!
//! # Modules
//! - `envelope` — bit-exact binary envelope on the device-to-device wire
//! - `message`  — plaintext message descriptor carried inside an envelope
//! - `api`      — provisioning-client JSON request/response schema (C8)

pub mod api;
pub mod envelope;
pub mod message;

pub use envelope::{TransportWrapper, WireEnvelope, WIRE_VERSION};
pub use message::{MessageContent, MessageDescriptor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("envelope is truncated")]
    Truncated,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected trailing bytes after envelope body")]
    TrailingBytes,
    #[error("bad iv length {0}")]
    BadIvLength(u16),
    #[error("envelope MAC verification failed")]
    AuthFailed,
    #[error(transparent)]
    Crypto(#[from] duskcore_crypto::CryptoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
