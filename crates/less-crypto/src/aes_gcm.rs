//! AES-256-GCM sealing for cached values.
//!
//! The nonce is stored next to the ciphertext rather than prefixed to it, so
//! a persisted record carries `{ciphertext, iv}` as separate fields.
//! AAD binds each ciphertext to its identity and cache key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::types::{EncryptionContext, AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH};

/// Ciphertext (with tag) plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; AES_GCM_IV_LENGTH],
}

/// Build AAD from an encryption context.
/// Format: [4 bytes: identity length (u32 BE)][identity UTF-8][key UTF-8]
fn build_aad(context: &EncryptionContext) -> Vec<u8> {
    let identity_bytes = context.identity.as_bytes();
    let key_bytes = context.key.as_bytes();
    let mut aad = Vec::with_capacity(4 + identity_bytes.len() + key_bytes.len());
    aad.extend_from_slice(&(identity_bytes.len() as u32).to_be_bytes());
    aad.extend_from_slice(identity_bytes);
    aad.extend_from_slice(key_bytes);
    aad
}

/// Generate a random 12-byte IV for AES-GCM.
pub fn generate_iv() -> Result<[u8; AES_GCM_IV_LENGTH], CryptoError> {
    let mut iv = [0u8; AES_GCM_IV_LENGTH];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(iv)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Encrypt `plaintext` under `key` with a fresh nonce.
pub fn seal(
    key: &[u8],
    plaintext: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<Sealed, CryptoError> {
    let cipher = cipher_for(key)?;
    let iv = generate_iv()?;
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = match context {
        Some(ctx) => {
            let aad = build_aad(ctx);
            cipher.encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
        }
        None => cipher.encrypt(nonce, plaintext),
    }
    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(Sealed { ciphertext, iv })
}

/// Decrypt a value produced by [`seal`].
///
/// `iv` is taken as a slice because persisted records come back as `Vec<u8>`.
pub fn open(
    key: &[u8],
    ciphertext: &[u8],
    iv: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    if iv.len() != AES_GCM_IV_LENGTH {
        return Err(CryptoError::InvalidIvLength {
            expected: AES_GCM_IV_LENGTH,
            got: iv.len(),
        });
    }
    if ciphertext.len() < AES_GCM_TAG_LENGTH {
        return Err(CryptoError::DataTooShort);
    }
    let nonce = Nonce::from_slice(iv);

    match context {
        Some(ctx) => {
            let aad = build_aad(ctx);
            cipher.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
        }
        None => cipher.decrypt(nonce, ciphertext),
    }
    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Check the platform once at startup: draw randomness and run a
/// seal/open round trip. Any failure means the subsystem cannot run.
pub fn ensure_available() -> Result<(), CryptoError> {
    let mut key = [0u8; AES_KEY_LENGTH];
    getrandom::getrandom(&mut key).map_err(|e| CryptoError::Unavailable(e.to_string()))?;

    let sample = b"less-cache:self-test";
    let sealed = seal(&key, sample, None).map_err(|e| CryptoError::Unavailable(e.to_string()))?;
    let opened = open(&key, &sealed.ciphertext, &sealed.iv, None)
        .map_err(|e| CryptoError::Unavailable(e.to_string()))?;
    if opened != sample {
        return Err(CryptoError::Unavailable(
            "AES-GCM round trip mismatch".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).unwrap();
        key
    }

    fn ctx(identity: &str, key: &str) -> EncryptionContext {
        EncryptionContext::new(identity, key)
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let sealed = seal(&key, b"Hello, World!", None).unwrap();
        let opened = open(&key, &sealed.ciphertext, &sealed.iv, None).unwrap();
        assert_eq!(opened, b"Hello, World!");
    }

    #[test]
    fn fresh_nonce_each_time() {
        let key = random_key();
        let a = seal(&key, b"test", None).unwrap();
        let b = seal(&key, b"test", None).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn ciphertext_includes_tag() {
        let key = random_key();
        let sealed = seal(&key, &[1, 2, 3], None).unwrap();
        assert_eq!(sealed.ciphertext.len(), 3 + AES_GCM_TAG_LENGTH);
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = random_key();
        let mut sealed = seal(&key, b"secret", None).unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0xff;
        assert!(open(&key, &sealed.ciphertext, &sealed.iv, None).is_err());
    }

    #[test]
    fn rejects_wrong_iv() {
        let key = random_key();
        let sealed = seal(&key, b"secret", None).unwrap();
        let mut iv = sealed.iv;
        iv[0] ^= 0x01;
        assert!(open(&key, &sealed.ciphertext, &iv, None).is_err());
    }

    #[test]
    fn rejects_bad_iv_length() {
        let key = random_key();
        let sealed = seal(&key, b"secret", None).unwrap();
        let err = open(&key, &sealed.ciphertext, &sealed.iv[..8], None).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidIvLength { got: 8, .. }));
    }

    #[test]
    fn rejects_truncated_data() {
        let key = random_key();
        let err = open(&key, &[0u8; 10], &[0u8; 12], None).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(seal(&[0u8; 16], b"x", None).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&random_key(), b"secret", None).unwrap();
        assert!(open(&random_key(), &sealed.ciphertext, &sealed.iv, None).is_err());
    }

    #[test]
    fn handles_empty_plaintext() {
        let key = random_key();
        let sealed = seal(&key, b"", None).unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.iv, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn handles_large_data() {
        let key = random_key();
        let mut plaintext = vec![0u8; 100 * 1024];
        getrandom::getrandom(&mut plaintext).unwrap();
        let sealed = seal(&key, &plaintext, None).unwrap();
        assert_eq!(
            open(&key, &sealed.ciphertext, &sealed.iv, None).unwrap(),
            plaintext
        );
    }

    #[test]
    fn aad_round_trip() {
        let key = random_key();
        let c = ctx("user-1", "users.get:abc");
        let sealed = seal(&key, b"bound data", Some(&c)).unwrap();
        let opened = open(&key, &sealed.ciphertext, &sealed.iv, Some(&c)).unwrap();
        assert_eq!(opened, b"bound data");
    }

    #[test]
    fn aad_wrong_identity_fails() {
        let key = random_key();
        let sealed = seal(&key, b"data", Some(&ctx("user-1", "k"))).unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.iv, Some(&ctx("user-2", "k"))).is_err());
    }

    #[test]
    fn aad_wrong_key_fails() {
        let key = random_key();
        let sealed = seal(&key, b"data", Some(&ctx("user-1", "k1"))).unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.iv, Some(&ctx("user-1", "k2"))).is_err());
    }

    #[test]
    fn aad_length_prefix_prevents_boundary_shift() {
        let key = random_key();
        let sealed = seal(&key, b"data", Some(&ctx("ab", "c"))).unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.iv, Some(&ctx("a", "bc"))).is_err());
    }

    #[test]
    fn aad_mismatch_context_vs_none() {
        let key = random_key();
        let c = ctx("user-1", "k");

        let enc1 = seal(&key, b"no context", None).unwrap();
        assert!(open(&key, &enc1.ciphertext, &enc1.iv, Some(&c)).is_err());

        let enc2 = seal(&key, b"with context", Some(&c)).unwrap();
        assert!(open(&key, &enc2.ciphertext, &enc2.iv, None).is_err());
    }

    #[test]
    fn self_test_succeeds_on_this_platform() {
        ensure_available().unwrap();
    }
}
