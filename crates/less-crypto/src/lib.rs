//! Cryptographic primitives for the encrypted offline cache.
//!
//! Two-tier hierarchy: a server-mirrored, versioned master key (KEK) wraps a
//! per-identity data key (DEK); the DEK seals every cached value.

pub mod aes_gcm;
pub mod base64url;
pub mod error;
pub mod keys;
pub mod types;

pub use crate::aes_gcm::{ensure_available, generate_iv, open, seal, Sealed};
pub use base64url::{base64url_decode, base64url_encode};
pub use error::CryptoError;
pub use keys::{unwrap_data_key, wrap_data_key, DataKey, MasterKey, WrappedKey, WRAPPED_DEK_SIZE};
pub use types::{EncryptionContext, AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH};
