//! Field-level encryption for sensitive replica attributes
//! (`emr_payload.raw_fields`, `patient_reference`) using `ChaCha20Poly1305`.
//!
//! The KMS key lookup itself is an external collaborator (out of scope);
//! callers supply a [`KeyProvider`] resolved at construction time.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error, Clone)]
pub enum EncryptionError {
    #[error("unknown encryption key id: {0}")]
    UnknownKey(String),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed: ciphertext may be corrupt or the key id changed")]
    DecryptFailed,
}

/// Resolves a symmetric key by id. A real deployment backs this with a KMS
/// client; here it is a trait object supplied at construction, matching the
/// "singleton managers become explicit dependencies" design note.
pub trait KeyProvider: Send + Sync {
    fn key_for(&self, key_id: &str) -> Result<[u8; 32], EncryptionError>;
}

/// A `KeyProvider` holding one fixed key, for tests and the demo binary.
/// Never appropriate for a real key_id's actual material.
pub struct StaticKeyProvider {
    key_id: String,
    key: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(key_id: impl Into<String>, key: [u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key_for(&self, key_id: &str) -> Result<[u8; 32], EncryptionError> {
        if key_id == self.key_id {
            Ok(self.key)
        } else {
            Err(EncryptionError::UnknownKey(key_id.to_string()))
        }
    }
}

/// Encrypt `plaintext` under `key_id`, returning `nonce || ciphertext`.
pub fn encrypt(
    keys: &dyn KeyProvider,
    key_id: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let mut key_bytes = keys.key_for(key_id)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    key_bytes.zeroize();

    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`].
pub fn decrypt(
    keys: &dyn KeyProvider,
    key_id: &str,
    sealed: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < 12 {
        return Err(EncryptionError::DecryptFailed);
    }
    let mut key_bytes = keys.key_for(key_id)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    key_bytes.zeroize();

    let (nonce_bytes, ciphertext) = sealed.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let keys = StaticKeyProvider::new("k1", [7u8; 32]);
        let plaintext = b"patient-12345";
        let sealed = encrypt(&keys, "k1", plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        let recovered = decrypt(&keys, "k1", &sealed).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn wrong_key_id_fails() {
        let keys = StaticKeyProvider::new("k1", [7u8; 32]);
        let err = encrypt(&keys, "k2", b"x").unwrap_err();
        assert!(matches!(err, EncryptionError::UnknownKey(_)));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let keys = StaticKeyProvider::new("k1", [7u8; 32]);
        let mut sealed = encrypt(&keys, "k1", b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(decrypt(&keys, "k1", &sealed).is_err());
    }
}
