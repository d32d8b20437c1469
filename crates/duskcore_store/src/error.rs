use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store has not been opened — call init() first")]
    NotReady,

    #[error("crypto error: {0}")]
    Crypto(#[from] duskcore_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("bad parameters: {0}")]
    BadParams(String),
}

impl StoreError {
    /// The `SqlError(code, msg)` numeric the public boundary forwards
    /// (spec.md §7). Non-SQL variants get fixed small negative codes so a
    /// conformant implementation returns the same code for the same input.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::Database(e) => -(1000 + sqlite_extended_code(e)),
            StoreError::NotReady => -2,
            StoreError::Crypto(_) => -3,
            StoreError::Serialisation(_) => -4,
            StoreError::NotFound(_) => -5,
            StoreError::Migration(_) => -6,
            StoreError::BadParams(_) => -7,
        }
    }
}

fn sqlite_extended_code(err: &sqlx::Error) -> i32 {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .unwrap_or(0),
        _ => 0,
    }
}
