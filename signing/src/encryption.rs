//! Encryption of private keys at rest
//!
//! AES-256-GCM with a key derived from the configured passphrase. Ciphertexts are stored
//! as hex of `nonce (12 bytes) || ciphertext`.

use crate::{Result, SigningError};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts private keys
pub trait PrivateKeyEncrypter: Send + Sync {
    /// Encrypt a secret
    fn encrypt(&self, secret: &str) -> Result<String>;

    /// Decrypt a secret
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// AES-256-GCM encrypter
pub struct AesGcmEncrypter {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmEncrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmEncrypter").finish_non_exhaustive()
    }
}

impl AesGcmEncrypter {
    /// Derive the cipher key from a passphrase
    pub fn new(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(SigningError::Encryption(
                "encryption passphrase cannot be empty".to_string(),
            ));
        }

        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }
}

impl PrivateKeyEncrypter for AesGcmEncrypter {
    fn encrypt(&self, secret: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted = self
            .cipher
            .encrypt(&nonce, secret.as_bytes())
            .map_err(|_| SigningError::Encryption("encryption failed".to_string()))?;

        let mut data = Vec::with_capacity(NONCE_LEN + encrypted.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&encrypted);
        Ok(hex::encode(data))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let data = hex::decode(ciphertext)
            .map_err(|_| SigningError::Encryption("ciphertext is not valid hex".to_string()))?;
        if data.len() <= NONCE_LEN {
            return Err(SigningError::Encryption("ciphertext is too short".to_string()));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let decrypted = self
            .cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| SigningError::Encryption("decryption failed".to_string()))?;

        String::from_utf8(decrypted)
            .map_err(|_| SigningError::Encryption("decrypted key is not utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_encrypt_decrypt() {
        let encrypter = AesGcmEncrypter::new("channel-account-passphrase").unwrap();
        let ciphertext = encrypter.encrypt("secret-seed").unwrap();

        assert_ne!(ciphertext, "secret-seed");
        assert_eq!(encrypter.decrypt(&ciphertext).unwrap(), "secret-seed");
    }

    #[test]
    fn test_nonce_is_random() {
        let encrypter = AesGcmEncrypter::new("passphrase").unwrap();
        assert_ne!(
            encrypter.encrypt("same").unwrap(),
            encrypter.encrypt("same").unwrap()
        );
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let ciphertext = AesGcmEncrypter::new("right").unwrap().encrypt("seed").unwrap();
        let wrong = AesGcmEncrypter::new("wrong").unwrap();
        assert!(matches!(
            wrong.decrypt(&ciphertext),
            Err(SigningError::Encryption(_))
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert_err!(AesGcmEncrypter::new(""));
    }
}
