//! Master key (KEK) and data key (DEK) primitives.
//!
//! Each identity gets one random 256-bit DEK that seals every cached value.
//! The DEK is persisted only wrapped: AES-256-GCM under the KEK with a fresh
//! nonce, and the KEK version bound into the AAD so a version tag cannot be
//! swapped without failing authentication.
//!
//! Wrapped DEK record: `{wrappedBytes: AES-GCM(KEK, DEK):48, wrapIV:12, wrappedByKekVersion}`

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::types::{AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH};

/// Size of the wrapped DEK ciphertext: 32 key bytes + 16 tag bytes.
pub const WRAPPED_DEK_SIZE: usize = AES_KEY_LENGTH + AES_GCM_TAG_LENGTH;

const WRAP_AAD_PREFIX: &[u8] = b"less-cache:dek-wrap:v1:";

fn random_key() -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
    let mut key = [0u8; AES_KEY_LENGTH];
    getrandom::getrandom(&mut key).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(key)
}

fn key_array(bytes: &[u8]) -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: AES_KEY_LENGTH,
        got: bytes.len(),
    })
}

/// Per-identity symmetric key used to encrypt all cached values.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; AES_KEY_LENGTH],
}

impl DataKey {
    /// Generate a random 256-bit data key.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: random_key()?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: key_array(bytes)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for DataKey {}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Server-mirrored key used only to wrap and unwrap the data key.
///
/// The version lives with whoever issued the key, not in the key itself.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; AES_KEY_LENGTH],
}

impl MasterKey {
    /// Generate a random 256-bit master key.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: random_key()?,
        })
    }

    /// Import a master key from its transport form.
    pub fn import(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: key_array(bytes)?,
        })
    }

    /// Export the transport form handed to the key-issuance service and to
    /// the session cache. The caller owns zeroizing the returned buffer.
    pub fn export(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for MasterKey {}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Persisted form of a data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    #[serde(with = "crate::base64url::serde_bytes_b64")]
    pub wrapped_bytes: Vec<u8>,
    #[serde(rename = "wrapIV", with = "crate::base64url::serde_bytes_b64")]
    pub wrap_iv: Vec<u8>,
    pub wrapped_by_kek_version: u32,
}

fn wrap_aad(kek_version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_AAD_PREFIX.len() + 4);
    aad.extend_from_slice(WRAP_AAD_PREFIX);
    aad.extend_from_slice(&kek_version.to_be_bytes());
    aad
}

/// Wrap a data key under a master key, recording the master key's version.
pub fn wrap_data_key(
    data_key: &DataKey,
    master_key: &MasterKey,
    kek_version: u32,
) -> Result<WrappedKey, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(master_key.as_bytes())
        .map_err(|e| CryptoError::WrapFailed(e.to_string()))?;
    let iv = crate::aes_gcm::generate_iv()?;
    let aad = wrap_aad(kek_version);
    let wrapped = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: data_key.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::WrapFailed(e.to_string()))?;

    Ok(WrappedKey {
        wrapped_bytes: wrapped,
        wrap_iv: iv.to_vec(),
        wrapped_by_kek_version: kek_version,
    })
}

/// Unwrap a data key.
///
/// Any mismatch between key, nonce, ciphertext and version tag fails with
/// [`CryptoError::UnwrapFailed`]; no partial key material is ever returned.
pub fn unwrap_data_key(wrapped: &WrappedKey, master_key: &MasterKey) -> Result<DataKey, CryptoError> {
    if wrapped.wrapped_bytes.len() != WRAPPED_DEK_SIZE {
        return Err(CryptoError::UnwrapFailed(format!(
            "wrapped key must be {} bytes, got {}",
            WRAPPED_DEK_SIZE,
            wrapped.wrapped_bytes.len()
        )));
    }
    if wrapped.wrap_iv.len() != AES_GCM_IV_LENGTH {
        return Err(CryptoError::UnwrapFailed(format!(
            "wrap IV must be {} bytes, got {}",
            AES_GCM_IV_LENGTH,
            wrapped.wrap_iv.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(master_key.as_bytes())
        .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))?;
    let aad = wrap_aad(wrapped.wrapped_by_kek_version);
    let mut raw = cipher
        .decrypt(
            Nonce::from_slice(&wrapped.wrap_iv),
            Payload {
                msg: &wrapped.wrapped_bytes,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))?;

    let key = DataKey::from_bytes(&raw);
    raw.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique() {
        let a = DataKey::generate().unwrap();
        let b = DataKey::generate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), AES_KEY_LENGTH);
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();

        let wrapped = wrap_data_key(&dek, &kek, 5).unwrap();
        assert_eq!(wrapped.wrapped_by_kek_version, 5);
        assert_eq!(wrapped.wrapped_bytes.len(), WRAPPED_DEK_SIZE);
        assert_eq!(wrapped.wrap_iv.len(), AES_GCM_IV_LENGTH);

        let unwrapped = unwrap_data_key(&wrapped, &kek).unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[test]
    fn wrapping_twice_uses_fresh_nonces() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();
        let a = wrap_data_key(&dek, &kek, 1).unwrap();
        let b = wrap_data_key(&dek, &kek, 1).unwrap();
        assert_ne!(a.wrap_iv, b.wrap_iv);
        assert_ne!(a.wrapped_bytes, b.wrapped_bytes);
    }

    #[test]
    fn wrong_kek_fails() {
        let dek = DataKey::generate().unwrap();
        let kek1 = MasterKey::generate().unwrap();
        let kek2 = MasterKey::generate().unwrap();
        let wrapped = wrap_data_key(&dek, &kek1, 1).unwrap();
        let err = unwrap_data_key(&wrapped, &kek2).unwrap_err();
        assert!(matches!(err, CryptoError::UnwrapFailed(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();
        let mut wrapped = wrap_data_key(&dek, &kek, 1).unwrap();
        let last = wrapped.wrapped_bytes.len() - 1;
        wrapped.wrapped_bytes[last] ^= 0xff;
        assert!(unwrap_data_key(&wrapped, &kek).is_err());
    }

    #[test]
    fn tampered_version_fails() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();
        let mut wrapped = wrap_data_key(&dek, &kek, 1).unwrap();
        wrapped.wrapped_by_kek_version = 2;
        assert!(matches!(
            unwrap_data_key(&wrapped, &kek),
            Err(CryptoError::UnwrapFailed(_))
        ));
    }

    #[test]
    fn wrong_lengths_fail() {
        let kek = MasterKey::generate().unwrap();
        let short = WrappedKey {
            wrapped_bytes: vec![0u8; 20],
            wrap_iv: vec![0u8; AES_GCM_IV_LENGTH],
            wrapped_by_kek_version: 1,
        };
        assert!(unwrap_data_key(&short, &kek).is_err());

        let bad_iv = WrappedKey {
            wrapped_bytes: vec![0u8; WRAPPED_DEK_SIZE],
            wrap_iv: vec![0u8; 4],
            wrapped_by_kek_version: 1,
        };
        assert!(unwrap_data_key(&bad_iv, &kek).is_err());
    }

    #[test]
    fn master_key_export_import() {
        let kek = MasterKey::generate().unwrap();
        let exported = kek.export();
        assert_eq!(exported.len(), AES_KEY_LENGTH);
        assert_eq!(MasterKey::import(&exported).unwrap(), kek);
        assert!(MasterKey::import(&exported[..16]).is_err());
    }

    #[test]
    fn large_version() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();
        let wrapped = wrap_data_key(&dek, &kek, u32::MAX).unwrap();
        assert_eq!(unwrap_data_key(&wrapped, &kek).unwrap(), dek);
    }

    #[test]
    fn wrapped_key_json_shape() {
        let dek = DataKey::generate().unwrap();
        let kek = MasterKey::generate().unwrap();
        let wrapped = wrap_data_key(&dek, &kek, 3).unwrap();
        let json = serde_json::to_value(&wrapped).unwrap();
        assert_eq!(json["wrappedByKekVersion"], 3);
        assert!(json["wrapIV"].is_string());
        assert!(json["wrappedBytes"].is_string());

        let back: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, wrapped);
        assert_eq!(unwrap_data_key(&back, &kek).unwrap(), dek);
    }

    #[test]
    fn debug_output_is_redacted() {
        let dek = DataKey::generate().unwrap();
        assert_eq!(format!("{dek:?}"), "DataKey(<redacted>)");
        let hex_bytes = hex::encode(dek.as_bytes());
        assert!(!format!("{dek:?}").contains(&hex_bytes));
    }
}
