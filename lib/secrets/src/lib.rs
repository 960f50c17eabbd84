//! C9: symmetric encryption of environment variable maps at rest.
//!
//! Environment variable maps (Deployment.env, Workspace secret env) are
//! stored encrypted and are only decrypted when assembling a container's
//! environment list. The key is process-wide, loaded once from
//! configuration; key rotation is out of scope (spec Open Question #3).

use std::collections::BTreeMap;

use aes_gcm::{
  Aes256Gcm, Key, Nonce,
  aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
  #[error("KALPANA_SECRET_KEY is not valid base64: {0}")]
  InvalidKeyEncoding(base64::DecodeError),
  #[error(
    "KALPANA_SECRET_KEY must decode to 32 bytes, got {0}"
  )]
  InvalidKeyLength(usize),
  #[error("ciphertext is not valid base64: {0}")]
  InvalidCiphertextEncoding(base64::DecodeError),
  #[error("ciphertext is too short to contain a nonce")]
  CiphertextTooShort,
  #[error("decryption failed, key mismatch or corrupted ciphertext")]
  DecryptionFailed,
  #[error("encryption failed")]
  EncryptionFailed,
  #[error("failed to (de)serialize env map: {0}")]
  Serde(#[from] serde_json::Error),
}

const NONCE_LEN: usize = 12;

/// Holds the process-wide AES-256-GCM key. Constructed once at startup
/// and shared (behind an `Arc`) by every component that encrypts or
/// decrypts an env map.
pub struct SecretCipher {
  cipher: Aes256Gcm,
}

impl SecretCipher {
  /// `key` must be exactly 32 raw bytes.
  pub fn new(key: &[u8]) -> Result<Self, SecretError> {
    if key.len() != 32 {
      return Err(SecretError::InvalidKeyLength(key.len()));
    }
    let key = Key::<Aes256Gcm>::from_slice(key);
    Ok(Self { cipher: Aes256Gcm::new(key) })
  }

  /// `raw` is the base64-encoded 32-byte key, as read from
  /// `KALPANA_SECRET_KEY`.
  pub fn from_base64(raw: &str) -> Result<Self, SecretError> {
    let key = STANDARD
      .decode(raw.trim())
      .map_err(SecretError::InvalidKeyEncoding)?;
    Self::new(&key)
  }

  /// Encrypts a sorted environment map into a single base64 blob:
  /// `base64(nonce || ciphertext)`. A `BTreeMap` is used (rather than
  /// `HashMap`) so the plaintext serialization, and therefore every
  /// decrypted round-trip, is key-ordered and deterministic for tests.
  pub fn encrypt_env(
    &self,
    env: &BTreeMap<String, String>,
  ) -> Result<String, SecretError> {
    let plaintext = serde_json::to_vec(env)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = self
      .cipher
      .encrypt(&nonce, plaintext.as_ref())
      .map_err(|_| SecretError::EncryptionFailed)?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce.as_slice());
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
  }

  pub fn decrypt_env(
    &self,
    blob: &str,
  ) -> Result<BTreeMap<String, String>, SecretError> {
    let raw = STANDARD
      .decode(blob)
      .map_err(SecretError::InvalidCiphertextEncoding)?;
    if raw.len() < NONCE_LEN {
      return Err(SecretError::CiphertextTooShort);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce);
    let plaintext = self
      .cipher
      .decrypt(nonce, ciphertext)
      .map_err(|_| SecretError::DecryptionFailed)?;
    Ok(serde_json::from_slice(&plaintext)?)
  }
}

/// Renders a decrypted env map as `KEY=VALUE` pairs suitable for
/// `bollard`'s `ContainerCreateBody::env`.
pub fn env_map_to_container_env(
  env: &BTreeMap<String, String>,
) -> Vec<String> {
  env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_cipher() -> SecretCipher {
    SecretCipher::new(&[7u8; 32]).unwrap()
  }

  #[test]
  fn round_trips_env_map() {
    let cipher = test_cipher();
    let mut env = BTreeMap::new();
    env.insert("DATABASE_URL".to_string(), "postgres://x".to_string());
    env.insert("PORT".to_string(), "3000".to_string());

    let blob = cipher.encrypt_env(&env).unwrap();
    let decrypted = cipher.decrypt_env(&blob).unwrap();
    assert_eq!(env, decrypted);
  }

  #[test]
  fn rejects_wrong_key() {
    let env = BTreeMap::from([("A".to_string(), "b".to_string())]);
    let blob = test_cipher().encrypt_env(&env).unwrap();
    let wrong = SecretCipher::new(&[9u8; 32]).unwrap();
    assert!(wrong.decrypt_env(&blob).is_err());
  }

  #[test]
  fn rejects_short_key() {
    assert!(matches!(
      SecretCipher::new(&[0u8; 16]),
      Err(SecretError::InvalidKeyLength(16))
    ));
  }

  #[test]
  fn container_env_formatting() {
    let mut env = BTreeMap::new();
    env.insert("A".to_string(), "1".to_string());
    env.insert("B".to_string(), "2".to_string());
    assert_eq!(
      env_map_to_container_env(&env),
      vec!["A=1".to_string(), "B=2".to_string()]
    );
  }
}
