use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Required cryptographic primitives are unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid IV length: expected {expected} bytes, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key wrap failed: {0}")]
    WrapFailed(String),

    #[error("Key unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}
