//! Key pairs for ledger accounts
//!
//! An account address is the hex-encoded ed25519 public key. Secrets are exchanged
//! as hex-encoded 32-byte seeds.

use crate::{LedgerError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Ed25519 key pair for a ledger account
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Parse a hex-encoded secret seed
    pub fn from_secret(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|_| LedgerError::Key("secret is not valid hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::Key("secret must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Public address of the account
    pub fn address(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    /// Hex-encoded secret seed. Callers must encrypt it before persisting.
    pub fn secret(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Sign a message, returning the raw signature bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify a signature against an account address
pub fn verify_signature(address: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = hex::decode(address) else {
        return false;
    };
    let Ok(public_key) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key.verify(message, &signature).is_ok()
}

/// Whether a string is a well-formed account address
pub fn is_valid_address(address: &str) -> bool {
    hex::decode(address)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
        .map(|bytes| VerifyingKey::from_bytes(&bytes).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"payment batch";

        let signature = keypair.sign(message);

        assert!(verify_signature(&keypair.address(), message, &signature));
        assert!(!verify_signature(&keypair.address(), b"other", &signature));
    }

    #[test]
    fn test_secret_roundtrip_keeps_address() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret(&keypair.secret()).unwrap();
        assert_eq!(keypair.address(), restored.address());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let rendered = format!("{:?}", keypair);
        assert!(rendered.contains(&keypair.address()));
        assert!(!rendered.contains(&keypair.secret()));
    }

    #[test]
    fn test_invalid_secret() {
        assert_err!(KeyPair::from_secret("zz"));
        assert_err!(KeyPair::from_secret("abcd"));
        assert!(!is_valid_address("not-an-address"));
    }
}
