//! The service keypair
//!
//! The secret is the AEAD key under which third-party caveat ids addressed to
//! this service are sealed. The public half is a stable identifier derived
//! from the secret, safe to publish in a third-party locator.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::crypto::KEY_LEN;

/// The service's long-lived keypair
#[derive(Clone)]
pub struct KeyPair {
    secret: [u8; KEY_LEN],
    public: String,
}

impl KeyPair {
    /// Generate a fresh keypair from the system RNG
    pub fn generate() -> Self {
        let mut secret = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    /// Reconstruct a keypair from its secret bytes
    pub fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let public = URL_SAFE_NO_PAD.encode(Sha256::digest(secret));
        Self { secret, public }
    }

    /// The public key identifier
    pub fn public(&self) -> &str {
        &self.public
    }

    /// The secret AEAD key. Handle with care; never log it.
    pub fn secret(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret in debug output
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.secret(), b.secret());
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let kp = KeyPair::generate();
        let again = KeyPair::from_secret(*kp.secret());
        assert_eq!(kp.public(), again.public());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::generate();
        let debug = format!("{:?}", kp);
        let secret64 = URL_SAFE_NO_PAD.encode(kp.secret());
        assert!(!debug.contains(&secret64));
        assert!(debug.contains(kp.public()));
    }
}
