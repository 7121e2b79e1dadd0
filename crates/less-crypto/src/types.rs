/// AES-GCM IV length in bytes (96 bits per NIST recommendation).
pub const AES_GCM_IV_LENGTH: usize = 12;

/// AES-GCM tag length in bytes (128 bits).
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES key length in bytes (256 bits).
pub const AES_KEY_LENGTH: usize = 32;

/// Context for binding ciphertext to a specific cache entry via AAD.
/// Prevents ciphertext relocation between keys or identities.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    /// Identity (namespace) the entry belongs to.
    pub identity: String,
    /// Composite cache key.
    pub key: String,
}

impl EncryptionContext {
    pub fn new(identity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
        }
    }
}
