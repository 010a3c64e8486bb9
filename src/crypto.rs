//! Webhook secret encryption using AES-256-GCM
//!
//! Shared secrets are never stored in plaintext. Each ciphertext carries a
//! version byte and a random nonce, and the AAD binds it to the owning
//! webhook config id so ciphertexts cannot be swapped between rows.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

fn secret_aad(config_id: Uuid) -> String {
    format!("webhook-config|{}", config_id)
}

/// Encrypt a webhook shared secret for storage on `webhook_configs.secret_ciphertext`.
pub fn encrypt_webhook_secret(
    key: &CryptoKey,
    config_id: Uuid,
    secret: &str,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(key, secret_aad(config_id).as_bytes(), secret.as_bytes())
}

/// Decrypt a stored webhook secret. The plaintext is wiped when dropped.
pub fn decrypt_webhook_secret(
    key: &CryptoKey,
    config_id: Uuid,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    decrypt_bytes(key, secret_aad(config_id).as_bytes(), ciphertext).map(Zeroizing::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CryptoKey {
        CryptoKey::new(vec![42u8; 32]).unwrap()
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn webhook_secret_decrypts_for_owning_config() {
        let config_id = Uuid::new_v4();
        let ciphertext = encrypt_webhook_secret(&key(), config_id, "s3cret").unwrap();

        assert_eq!(ciphertext[0], VERSION_ENCRYPTED);
        assert!(!ciphertext.windows(6).any(|window| window == b"s3cret"));

        let plaintext = decrypt_webhook_secret(&key(), config_id, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), b"s3cret");
    }

    #[test]
    fn webhook_secret_is_bound_to_config_id() {
        let ciphertext = encrypt_webhook_secret(&key(), Uuid::new_v4(), "s3cret").unwrap();
        let result = decrypt_webhook_secret(&key(), Uuid::new_v4(), &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let aad = b"aad";
        let ciphertext = encrypt_bytes(&key(), aad, b"payload").unwrap();
        assert!(matches!(
            decrypt_bytes(&key(), aad, &ciphertext[..10]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            decrypt_bytes(&key(), aad, &[]),
            Err(CryptoError::EmptyCiphertext)
        ));
    }
}
