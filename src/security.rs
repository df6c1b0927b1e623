//! Encryption at rest for proxy secrets
//!
//! IPs and passwords are stored as AES-256-GCM ciphertext with a random
//! 12-byte nonce prefix, base64-encoded. An empty plaintext maps to an empty
//! ciphertext so optional columns stay optional.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use crate::error::{MagpieError, Result};

const NONCE_LEN: usize = 12;

/// Cipher handle for proxy secrets, cheap to clone.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Derive a cipher from the configured key material.
    ///
    /// The key may be any non-empty string; it is stretched to 32 bytes with
    /// SHA-256 so operators can use passphrases.
    pub fn new(key_material: &str) -> Result<Self> {
        if key_material.trim().is_empty() {
            return Err(MagpieError::InvalidConfig(
                "PROXY_ENCRYPTION_KEY must not be empty".into(),
            ));
        }

        let key = Sha256::digest(key_material.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| MagpieError::Crypto("invalid AES key length".into()))?;

        Ok(Self { cipher })
    }

    /// Encrypt a secret. Empty input stays empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| MagpieError::Crypto("encryption failed".into()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(payload))
    }

    /// Decrypt a secret previously produced by [`encrypt`]. Empty input stays
    /// empty.
    ///
    /// [`encrypt`]: SecretCipher::encrypt
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let payload = BASE64
            .decode(encoded)
            .map_err(|_| MagpieError::Crypto("ciphertext is not valid base64".into()))?;

        if payload.len() < NONCE_LEN {
            return Err(MagpieError::Crypto("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| MagpieError::Crypto("decryption failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| MagpieError::Crypto("decrypted secret is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = SecretCipher::new("test-key").unwrap();

        let encrypted = cipher.encrypt("192.0.2.10").unwrap();
        assert_ne!(encrypted, "192.0.2.10");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "192.0.2.10");
    }

    #[test]
    fn test_empty_maps_to_empty() {
        let cipher = SecretCipher::new("test-key").unwrap();

        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_nonce_randomization() {
        let cipher = SecretCipher::new("test-key").unwrap();

        let a = cipher.encrypt("secret").unwrap();
        let b = cipher.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "secret");
        assert_eq!(cipher.decrypt(&b).unwrap(), "secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = SecretCipher::new("key-one").unwrap();
        let other = SecretCipher::new("key-two").unwrap();

        let encrypted = cipher.encrypt("secret").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(MagpieError::Crypto(_))
        ));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            SecretCipher::new("  "),
            Err(MagpieError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_garbage_ciphertext_rejected() {
        let cipher = SecretCipher::new("test-key").unwrap();
        assert!(matches!(
            cipher.decrypt("not base64 !!"),
            Err(MagpieError::Crypto(_))
        ));
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(MagpieError::Crypto(_))
        ));
    }
}
