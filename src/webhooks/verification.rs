//! # Webhook Signature Verification
//!
//! HMAC-SHA256/512 signing and constant-time verification over the raw
//! payload bytes, plus the in-memory replay guard used by the receiver.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::enums::SignatureAlgorithm;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: &'static str },

    #[error("Invalid signature format in {header}")]
    InvalidSignatureFormat { header: &'static str },

    #[error("Signature verification failed")]
    VerificationFailed,
}

fn mac_bytes(secret: &[u8], algorithm: SignatureAlgorithm, payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    match algorithm {
        SignatureAlgorithm::Sha256 => match HmacSha256::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
        SignatureAlgorithm::Sha512 => match HmacSha512::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
    }
}

/// Header value for `payload`, e.g. `sha256=9f86d0...`.
pub fn sign(secret: &[u8], algorithm: SignatureAlgorithm, payload: &[u8]) -> String {
    format!(
        "{}{}",
        algorithm.prefix(),
        hex::encode(mac_bytes(secret, algorithm, payload))
    )
}

/// Verifies a signature header value. The `sha256=` / `sha512=` prefix is optional.
pub fn verify(
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    payload: &[u8],
    signature: &str,
) -> Result<(), VerificationError> {
    let header = algorithm.header_name();
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(VerificationError::MissingSignature { header });
    }

    let provided_hex = signature.strip_prefix(algorithm.prefix()).unwrap_or(signature);
    let provided =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat { header })?;

    let expected = mac_bytes(secret, algorithm, payload);
    if expected.is_empty() || provided.len() != expected.len() {
        return Err(VerificationError::VerificationFailed);
    }
    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

pub fn verify_signature(
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    payload: &[u8],
    signature: &str,
) -> bool {
    verify(secret, algorithm, payload, signature).is_ok()
}

/// Hex SHA-256 of the raw payload, used for logging and replay detection.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Rejects a payload hash seen for the same config within the window.
#[derive(Debug)]
pub struct ReplayGuard {
    window: Duration,
    seen: Mutex<HashMap<(Uuid, String), Instant>>,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records the hash and returns `true` if it was not seen within the window.
    pub async fn check_and_record(&self, config_id: Uuid, payload_hash: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| now.saturating_duration_since(*at) < self.window);

        let key = (config_id, payload_hash.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    /// Drops a recorded hash so a redelivery of the same payload is accepted.
    pub async fn release(&self, config_id: Uuid, payload_hash: &str) {
        self.seen
            .lock()
            .await
            .remove(&(config_id, payload_hash.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"eventType":"resource.updated","resourceType":"Patient","resourceId":"p1"}"#;

    #[test]
    fn signed_payload_verifies_for_both_algorithms() {
        for algorithm in [SignatureAlgorithm::Sha256, SignatureAlgorithm::Sha512] {
            let signature = sign(SECRET, algorithm, PAYLOAD);
            assert!(signature.starts_with(algorithm.prefix()));
            assert_eq!(verify(SECRET, algorithm, PAYLOAD, &signature), Ok(()));

            let bare = signature.trim_start_matches(algorithm.prefix());
            assert!(verify_signature(SECRET, algorithm, PAYLOAD, bare));
        }
    }

    #[test]
    fn any_tampered_byte_fails() {
        let signature = sign(SECRET, SignatureAlgorithm::Sha256, PAYLOAD);
        for index in 0..PAYLOAD.len() {
            let mut tampered = PAYLOAD.to_vec();
            tampered[index] ^= 0x01;
            assert_eq!(
                verify(SECRET, SignatureAlgorithm::Sha256, &tampered, &signature),
                Err(VerificationError::VerificationFailed),
                "byte {index}"
            );
        }
    }

    #[test]
    fn wrong_secret_or_algorithm_fails() {
        let signature = sign(SECRET, SignatureAlgorithm::Sha256, PAYLOAD);
        assert!(!verify_signature(b"other", SignatureAlgorithm::Sha256, PAYLOAD, &signature));
        assert!(!verify_signature(SECRET, SignatureAlgorithm::Sha512, PAYLOAD, &signature));
    }

    #[test]
    fn malformed_signatures_are_reported() {
        assert_eq!(
            verify(SECRET, SignatureAlgorithm::Sha256, PAYLOAD, ""),
            Err(VerificationError::MissingSignature {
                header: "x-signature-sha256"
            })
        );
        assert!(matches!(
            verify(SECRET, SignatureAlgorithm::Sha256, PAYLOAD, "sha256=zz"),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
    }

    #[tokio::test]
    async fn replay_guard_rejects_repeats_per_config() {
        let guard = ReplayGuard::new(Duration::from_secs(300));
        let config = Uuid::new_v4();
        let hash = payload_hash(PAYLOAD);

        assert!(guard.check_and_record(config, &hash).await);
        assert!(!guard.check_and_record(config, &hash).await);
        assert!(guard.check_and_record(Uuid::new_v4(), &hash).await);
    }

    #[tokio::test]
    async fn replay_guard_forgets_after_window() {
        let guard = ReplayGuard::new(Duration::from_millis(50));
        let config = Uuid::new_v4();

        assert!(guard.check_and_record(config, "abc").await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(guard.check_and_record(config, "abc").await);
    }

    #[tokio::test]
    async fn released_hash_is_accepted_again() {
        let guard = ReplayGuard::new(Duration::from_secs(300));
        let config = Uuid::new_v4();

        assert!(guard.check_and_record(config, "abc").await);
        guard.release(config, "abc").await;
        assert!(guard.check_and_record(config, "abc").await);
        assert!(!guard.check_and_record(config, "abc").await);
    }
}
