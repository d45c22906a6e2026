//! Crypto primitives (C1): AEAD cipher, password-based KDF, nonce
//! derivation, and buffer pools. Grounded on the teacher crate's
//! `crypto.rs` (XChaCha20-Poly1305 + Argon2id + zeroized key types),
//! generalized to the pooled, seekable-chunk shape the container codec
//! needs.

mod aead;
mod kdf;
mod pool;

pub use aead::{open_chunk, seal_chunk};
pub use kdf::derive_key;
pub use pool::BufferPools;

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const CHUNK_SIZE: usize = 65_536;
pub const TAG_SIZE: usize = 16;
pub const CIPHERTEXT_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;
pub const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;

/// A 32-byte symmetric key, wiped on drop. Used for both the DEK and
/// one-shot derived keys (e.g. a password-derived KEK).
#[derive(Clone, ZeroizeOnDrop)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(REDACTED)")
    }
}

/// Derive the per-chunk nonce in place: copy `base_nonce`, then XOR its
/// first 8 bytes with the little-endian encoding of `chunk_index`.
pub fn derive_chunk_nonce_into(base_nonce: &[u8; NONCE_SIZE], chunk_index: u64, out: &mut [u8; NONCE_SIZE]) {
    out.copy_from_slice(base_nonce);
    let idx_bytes = chunk_index.to_le_bytes();
    for i in 0..8 {
        out[i] ^= idx_bytes[i];
    }
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::Rng;
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Zero a scratch buffer that may have held plaintext or key material.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}
