use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("IV must be exactly the AES block size (16 bytes)")]
    WrongBlockSize,

    #[error("Unsupported AES key size: must be 16 or 32 bytes")]
    UnsupportedKeySize,

    #[error("PKCS#7 padding invalid")]
    PaddingInvalid,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Session not initialised")]
    SessionNotInitialised,

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("establishment block identity does not match pinned remote identity")]
    IdentityMismatch,

    #[error("Chain gap too large: {skip} skipped messages exceeds bound of {bound}")]
    ChainGapTooLarge { skip: u64, bound: u64 },

    #[error("Nonce generation failed")]
    NonceGeneration,

    #[error("Prekey error: {0}")]
    PrekeyError(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
