//! Unified error taxonomy for the public boundary (spec.md §7).
//!
//! `CryptoError` and `StoreError` convert in via `From`; `code()` maps every
//! variant to a stable negative integer so identical inputs yield identical
//! codes across calls, and `info()` gives the human string a host surfaces
//! alongside it. Library code below this module always returns `CoreError`
//! directly rather than `anyhow` — `anyhow` stays an app-layer-only
//! dependency, as in the rest of this workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad parameters: {0}")]
    BadParams(String),

    #[error("store has not been opened")]
    NotReady,

    #[error("sql error: {0}")]
    SqlError(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("unknown pre-key id {0}")]
    UnknownPreKey(u32),

    #[error("signed pre-key signature verification failed")]
    BadSignedPreKeySig,

    #[error("remote identity changed for {user}/{device}")]
    IdentityMismatch { user: String, device: String },

    #[error("chain gap too large: {skip} exceeds bound {bound}")]
    ChainGapTooLarge { skip: u64, bound: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<duskcore_crypto::CryptoError> for CoreError {
    fn from(e: duskcore_crypto::CryptoError) -> Self {
        use duskcore_crypto::CryptoError as C;
        match e {
            C::ChainGapTooLarge { skip, bound } => CoreError::ChainGapTooLarge { skip, bound },
            C::SessionNotInitialised | C::AeadDecrypt | C::PaddingInvalid => CoreError::AuthFailed,
            // Callers that need the (user, device) pair to notify IDENTITY_CHANGED
            // intercept `CryptoError::IdentityMismatch` before this conversion runs
            // (see `dispatch::decrypt_and_deliver`); this arm is the fallback for
            // call sites that only have the crypto-level error in hand.
            C::IdentityMismatch => CoreError::IdentityMismatch { user: String::new(), device: String::new() },
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<duskcore_store::StoreError> for CoreError {
    fn from(e: duskcore_store::StoreError) -> Self {
        use duskcore_store::StoreError as S;
        match e {
            S::NotReady => CoreError::NotReady,
            S::Database(err) => CoreError::SqlError(err.to_string()),
            S::Crypto(c) => CoreError::from(c),
            S::BadParams(m) => CoreError::BadParams(m),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<duskcore_proto::ProtoError> for CoreError {
    fn from(e: duskcore_proto::ProtoError) -> Self {
        use duskcore_proto::ProtoError as P;
        match e {
            P::AuthFailed => CoreError::AuthFailed,
            other => CoreError::BadParams(other.to_string()),
        }
    }
}

impl CoreError {
    /// Stable negative numeric code for the public boundary (§7: "identical
    /// inputs must yield identical codes"). Callers outside Rust see this
    /// integer; `info()` carries the companion human string.
    pub fn code(&self) -> i32 {
        match self {
            CoreError::BadParams(_) => -1,
            CoreError::NotReady => -2,
            CoreError::SqlError(_) => -3,
            CoreError::AuthFailed => -4,
            CoreError::UnknownPreKey(_) => -5,
            CoreError::BadSignedPreKeySig => -6,
            CoreError::IdentityMismatch { .. } => -7,
            CoreError::ChainGapTooLarge { .. } => -8,
            CoreError::Transport(_) => -9,
            CoreError::Http(_) => -10,
            CoreError::OutOfMemory => -11,
            CoreError::Internal(_) => -12,
        }
    }

    pub fn info(&self) -> String {
        self.to_string()
    }
}
