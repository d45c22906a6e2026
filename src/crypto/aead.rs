//! XChaCha20-Poly1305 chunk sealing/opening. All authentication failures
//! collapse to `EceError::CorruptedData` — callers must never distinguish
//! "wrong password" from "corrupted ciphertext" (spec §4.1, §7).

use super::{Key, NONCE_SIZE};
use crate::error::EceError;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

fn cipher(key: &Key) -> Result<XChaCha20Poly1305, EceError> {
    XChaCha20Poly1305::new_from_slice(&key.0)
        .map_err(|_| EceError::Internal("cipher init failed".to_string()))
}

pub fn seal_chunk(key: &Key, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, EceError> {
    let cipher = cipher(key)?;
    let nonce = XNonce::from_slice(nonce);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EceError::Internal("encryption failed".to_string()))
}

pub fn open_chunk(key: &Key, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, EceError> {
    let cipher = cipher(key)?;
    let nonce = XNonce::from_slice(nonce);
    cipher.decrypt(nonce, ciphertext).map_err(|_| EceError::CorruptedData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn seal_then_open_roundtrips() {
        let key = Key::generate();
        let nonce = random_bytes::<NONCE_SIZE>();
        let plaintext = b"hello vault";
        let ciphertext = seal_chunk(&key, &nonce, plaintext).unwrap();
        let recovered = open_chunk(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tamper_is_reported_as_corrupted_data() {
        let key = Key::generate();
        let nonce = random_bytes::<NONCE_SIZE>();
        let mut ciphertext = seal_chunk(&key, &nonce, b"hello vault").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        let result = open_chunk(&key, &nonce, &ciphertext);
        assert!(matches!(result, Err(EceError::CorruptedData)));
    }

    #[test]
    fn wrong_key_is_reported_as_corrupted_data() {
        let key = Key::generate();
        let other = Key::generate();
        let nonce = random_bytes::<NONCE_SIZE>();
        let ciphertext = seal_chunk(&key, &nonce, b"hello vault").unwrap();
        let result = open_chunk(&other, &nonce, &ciphertext);
        assert!(matches!(result, Err(EceError::CorruptedData)));
    }
}
