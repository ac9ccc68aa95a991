use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

/// Prefix marking a value encrypted by this manager
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// Manages secrets and encryption for sensitive data
#[derive(Debug, Clone)]
pub struct SecretsManager {
    /// 32-byte AES-256 key
    encryption_key: Option<Vec<u8>>,
}

impl SecretsManager {
    /// Create a SecretsManager from `SECRETS_ENCRYPTION_KEY` (hex)
    pub fn new() -> Self {
        let key = std::env::var("SECRETS_ENCRYPTION_KEY").ok();
        match Self::from_hex_key(key.as_deref()) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!("Ignoring SECRETS_ENCRYPTION_KEY: {}", e);
                Self {
                    encryption_key: None,
                }
            }
        }
    }

    /// Build from an optional hex key; empty or missing means plaintext mode
    pub fn from_hex_key(hex_key: Option<&str>) -> Result<Self> {
        let encryption_key = match hex_key.map(str::trim).filter(|k| !k.is_empty()) {
            None => None,
            Some(k) => {
                let bytes = hex::decode(k).map_err(|e| anyhow!("key is not valid hex: {}", e))?;
                if bytes.len() != 32 {
                    return Err(anyhow!("key must be 32 bytes, got {}", bytes.len()));
                }
                Some(bytes)
            }
        };
        Ok(Self { encryption_key })
    }

    fn cipher(&self) -> Option<Aes256Gcm> {
        self.encryption_key
            .as_ref()
            .map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k)))
    }

    /// Decrypt an encrypted value
    pub fn decrypt(&self, value: &str) -> Result<String> {
        // Values written before encryption was enabled are stored as-is
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let cipher = self
            .cipher()
            .ok_or_else(|| anyhow!("encrypted value found but no encryption key configured"))?;

        // Layout: 12-byte nonce followed by ciphertext and tag
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| anyhow!("invalid ciphertext encoding: {}", e))?;
        if raw.len() <= NONCE_LEN {
            return Err(anyhow!("ciphertext too short"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed"))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("decrypted value is not UTF-8: {}", e))
    }

    /// Encrypt a plaintext value
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        // If no encryption key is set, return plaintext (dev mode)
        let Some(cipher) = self.cipher() else {
            return Ok(plaintext.to_string());
        };

        // Fresh random nonce per value; GCM must never reuse one under a key
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(raw)))
    }

    /// Check if encryption is active
    pub fn is_encryption_active(&self) -> bool {
        self.encryption_key.is_some()
    }
}

impl Default for SecretsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_decrypt() {
        let secrets = SecretsManager::from_hex_key(Some(KEY)).unwrap();
        let encrypted = secrets.encrypt("my-api-secret").unwrap();

        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert!(!encrypted.contains("my-api-secret"));
        assert_eq!(secrets.decrypt(&encrypted).unwrap(), "my-api-secret");
    }

    #[test]
    fn test_nonce_is_random() {
        let secrets = SecretsManager::from_hex_key(Some(KEY)).unwrap();
        assert_ne!(secrets.encrypt("x").unwrap(), secrets.encrypt("x").unwrap());
    }

    #[test]
    fn test_plaintext_mode() {
        let secrets = SecretsManager::from_hex_key(None).unwrap();
        assert!(!secrets.is_encryption_active());
        assert_eq!(secrets.encrypt("value").unwrap(), "value");
        assert_eq!(secrets.decrypt("value").unwrap(), "value");
    }

    #[test]
    fn test_unprefixed_value_passes_through() {
        let secrets = SecretsManager::from_hex_key(Some(KEY)).unwrap();
        assert_eq!(secrets.decrypt("legacy-plain").unwrap(), "legacy-plain");
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = SecretsManager::from_hex_key(Some(KEY)).unwrap();
        let b = SecretsManager::from_hex_key(Some(
            "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        ))
        .unwrap();
        let encrypted = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(SecretsManager::from_hex_key(Some("abcd")).is_err());
        assert!(SecretsManager::from_hex_key(Some("zz")).is_err());
    }
}
