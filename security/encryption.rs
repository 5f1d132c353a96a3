//! Token Encryption
//!
//! Authenticated encryption for secrets cached at rest:
//! - Argon2id key derivation from a passphrase and salt
//! - AES-256-GCM with a fresh 96-bit IV per payload
//! - Associated data bound into the authentication tag
//!
//! Decryption fails closed. A payload whose ciphertext, IV, tag, key or
//! associated data do not match what `encrypt` produced is rejected with
//! [`EncryptionError::Decryption`] and no plaintext is returned.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Key,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM IV length in bytes
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Shortest salt accepted by the key derivation function
pub const MIN_SALT_LENGTH: usize = 8;

/// Length of salts produced by [`EncryptionService::generate_salt`]
pub const GENERATED_SALT_LENGTH: usize = 16;

/// Encryption errors
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// Authentication tag did not verify: tampered payload, wrong key or
    /// mismatched associated data
    #[error("Decryption failed: payload authentication failed")]
    Decryption,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Argon2id cost parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Number of passes
    pub kdf_iterations: u32,

    /// Degree of parallelism
    pub kdf_parallelism: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            kdf_memory_kib: 19_456, // 19 MiB
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl EncryptionConfig {
    /// Build the argon2 parameter set, rejecting values outside argon2's limits
    pub fn params(&self) -> Result<Params> {
        Params::new(
            self.kdf_memory_kib,
            self.kdf_iterations,
            self.kdf_parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| EncryptionError::KeyDerivation(e.to_string()))
    }
}

/// 256-bit symmetric key. Zeroed when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded 32-byte key
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| EncryptionError::KeyDerivation(format!("Invalid key hex: {}", e)))?;

        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            EncryptionError::KeyDerivation(format!(
                "Key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;

        Ok(Self(key))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Output of a seal operation. The key is never part of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext, same length as the plaintext
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,

    /// 96-bit initialization vector
    #[serde(with = "hex::serde")]
    pub iv: Vec<u8>,

    /// 128-bit GCM authentication tag
    #[serde(with = "hex::serde")]
    pub auth_tag: Vec<u8>,
}

/// Key derivation and authenticated encryption
#[derive(Debug, Clone)]
pub struct EncryptionService {
    params: Params,
}

impl EncryptionService {
    /// Create a service with the given KDF cost
    pub fn new(config: &EncryptionConfig) -> Result<Self> {
        Ok(Self {
            params: config.params()?,
        })
    }

    /// Generate a random salt for [`generate_key`](Self::generate_key)
    pub fn generate_salt() -> [u8; GENERATED_SALT_LENGTH] {
        let mut salt = [0u8; GENERATED_SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Derive a key from a passphrase and salt.
    ///
    /// Deterministic: the same `(secret, salt)` always yields the same key.
    pub fn generate_key(&self, secret: &str, salt: &[u8]) -> Result<EncryptionKey> {
        if secret.is_empty() {
            return Err(EncryptionError::KeyDerivation(
                "Secret must not be empty".to_string(),
            ));
        }

        if salt.len() < MIN_SALT_LENGTH {
            return Err(EncryptionError::KeyDerivation(format!(
                "Salt must be at least {} bytes, got {}",
                MIN_SALT_LENGTH,
                salt.len()
            )));
        }

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(secret.as_bytes(), salt, &mut key)
            .map_err(|e| EncryptionError::KeyDerivation(e.to_string()))?;

        let derived = EncryptionKey(key);
        key.zeroize();

        debug!(salt_len = salt.len(), "Derived encryption key");
        Ok(derived)
    }

    /// Encrypt `plaintext`, binding `associated_data` into the tag
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &EncryptionKey,
        associated_data: Option<&[u8]>,
    ) -> Result<EncryptedPayload> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(&nonce, associated_data.unwrap_or_default(), &mut buffer)
            .map_err(|e| EncryptionError::Encryption(e.to_string()))?;

        Ok(EncryptedPayload {
            ciphertext: buffer,
            iv: nonce.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypt and verify. Any mismatch fails with [`EncryptionError::Decryption`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        key: &EncryptionKey,
        auth_tag: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if iv.len() != IV_LEN {
            return Err(EncryptionError::MalformedPayload(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }

        if auth_tag.len() != TAG_LEN {
            return Err(EncryptionError::MalformedPayload(format!(
                "Auth tag must be {} bytes, got {}",
                TAG_LEN,
                auth_tag.len()
            )));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

        let mut buffer = ciphertext.to_vec();
        let result = cipher.decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            associated_data.unwrap_or_default(),
            &mut buffer,
            GenericArray::from_slice(auth_tag),
        );

        match result {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                Err(EncryptionError::Decryption)
            }
        }
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt)
    pub fn open(
        &self,
        payload: &EncryptedPayload,
        key: &EncryptionKey,
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.decrypt(
            &payload.ciphertext,
            &payload.iv,
            key,
            &payload.auth_tag,
            associated_data,
        )
    }

    /// Encrypt a UTF-8 secret such as an access or refresh token
    pub fn seal_str(
        &self,
        plaintext: &str,
        key: &EncryptionKey,
        context: &str,
    ) -> Result<EncryptedPayload> {
        self.encrypt(plaintext.as_bytes(), key, Some(context.as_bytes()))
    }

    /// Reverse of [`seal_str`](Self::seal_str); `context` must match
    pub fn open_str(
        &self,
        payload: &EncryptedPayload,
        key: &EncryptionKey,
        context: &str,
    ) -> Result<String> {
        let bytes = self.open(payload, key, Some(context.as_bytes()))?;
        String::from_utf8(bytes).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            EncryptionError::InvalidUtf8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_service() -> EncryptionService {
        EncryptionService::new(&EncryptionConfig {
            kdf_memory_kib: 1024,
            kdf_iterations: 1,
            kdf_parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let service = fast_service();

        let a = service.generate_key("correct horse", b"salt-0001").unwrap();
        let b = service.generate_key("correct horse", b"salt-0001").unwrap();
        assert_eq!(a, b);

        // Different salt, different key
        let c = service.generate_key("correct horse", b"salt-0002").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_derivation_rejects_short_salt() {
        let service = fast_service();

        let result = service.generate_key("passphrase", b"short");
        assert!(matches!(result, Err(EncryptionError::KeyDerivation(_))));

        let result = service.generate_key("", b"long-enough-salt");
        assert!(matches!(result, Err(EncryptionError::KeyDerivation(_))));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([7u8; KEY_LEN]);

        let payload = service
            .encrypt(b"refresh-token-value", &key, Some("copilot.refresh_token".as_bytes()))
            .unwrap();

        assert_eq!(payload.iv.len(), IV_LEN);
        assert_eq!(payload.auth_tag.len(), TAG_LEN);
        assert_ne!(payload.ciphertext, b"refresh-token-value".to_vec());

        let plaintext = service
            .open(&payload, &key, Some("copilot.refresh_token".as_bytes()))
            .unwrap();
        assert_eq!(plaintext, b"refresh-token-value".to_vec());
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([1u8; KEY_LEN]);

        let first = service.encrypt(b"same", &key, None).unwrap();
        let second = service.encrypt(b"same", &key, None).unwrap();
        assert_ne!(first.iv, second.iv);
    }

    #[test]
    fn test_associated_data_mismatch_fails() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([3u8; KEY_LEN]);

        let payload = service.seal_str("token", &key, "flow.access_token").unwrap();

        let result = service.open_str(&payload, &key, "flow.refresh_token");
        assert!(matches!(result, Err(EncryptionError::Decryption)));

        // Missing associated data also fails
        let result = service.open(&payload, &key, None);
        assert!(matches!(result, Err(EncryptionError::Decryption)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([3u8; KEY_LEN]);
        let other = EncryptionKey::from_bytes([4u8; KEY_LEN]);

        let payload = service.seal_str("token", &key, "ctx").unwrap();
        assert!(matches!(
            service.open_str(&payload, &other, "ctx"),
            Err(EncryptionError::Decryption)
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([9u8; KEY_LEN]);

        let mut payload = service.seal_str("token", &key, "ctx").unwrap();
        payload.auth_tag[0] ^= 0x01;

        assert!(matches!(
            service.open_str(&payload, &key, "ctx"),
            Err(EncryptionError::Decryption)
        ));
    }

    #[test]
    fn test_malformed_lengths_do_not_panic() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([9u8; KEY_LEN]);

        let result = service.decrypt(b"abc", &[0u8; 5], &key, &[0u8; TAG_LEN], None);
        assert!(matches!(result, Err(EncryptionError::MalformedPayload(_))));

        let result = service.decrypt(b"abc", &[0u8; IV_LEN], &key, &[0u8; 3], None);
        assert!(matches!(result, Err(EncryptionError::MalformedPayload(_))));
    }

    #[test]
    fn test_payload_serializes_as_hex() {
        let service = fast_service();
        let key = EncryptionKey::from_bytes([5u8; KEY_LEN]);

        let payload = service.seal_str("token", &key, "ctx").unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let restored: EncryptedPayload = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, payload);
        assert_eq!(service.open_str(&restored, &key, "ctx").unwrap(), "token");
    }

    #[test]
    fn test_key_from_hex() {
        let key = EncryptionKey::from_hex(&"ab".repeat(KEY_LEN)).unwrap();
        assert_eq!(key.as_bytes(), &[0xab; KEY_LEN]);

        assert!(EncryptionKey::from_hex("abcd").is_err());
        assert!(EncryptionKey::from_hex("zz").is_err());
        assert_eq!(format!("{:?}", key), "EncryptionKey([REDACTED])");
    }
}
