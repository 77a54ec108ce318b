//! HMAC chain links and caveat-id sealing
//!
//! Signatures are HMAC-SHA256 over the previous link; caveat ids and
//! verification ids are sealed with ChaCha20-Poly1305, nonce prepended to the
//! ciphertext.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Length in bytes of keys and signatures
pub const KEY_LEN: usize = 32;

/// Length in bytes of the AEAD nonce prepended to sealed data
const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Compute one HMAC-SHA256 chain link
pub fn chain(key: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute a chain link over two concatenated inputs
pub fn chain2(key: &[u8], a: &[u8], b: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(a);
    mac.update(b);
    mac.finalize().into_bytes().into()
}

/// Encrypt `plaintext` under `key`, returning nonce-prefixed ciphertext
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Seal(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt nonce-prefixed data produced by [`seal`]
pub fn open(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Decode("sealed data too short".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decode("sealed data".to_string()))
}
