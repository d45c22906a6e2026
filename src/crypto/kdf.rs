//! Password-based key derivation. Grounded on the teacher crate's
//! `EncryptionKey::from_password`, pinned to the spec's fixed Argon2id
//! parameters rather than the teacher's own dead-drop tuning.

use super::{Key, SALT_SIZE};
use argon2::{Algorithm, Argon2, Params, Version};

/// time=1, memory=64 MiB, parallelism=4, output=32 bytes.
const ARGON2_TIME_COST: u32 = 1;
const ARGON2_MEMORY_COST_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

pub fn derive_key(password: &str, salt: &[u8; SALT_SIZE]) -> Result<Key, argon2::Error> {
    let params = Params::new(
        ARGON2_MEMORY_COST_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(super::KEY_SIZE),
    )?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = [0u8; super::KEY_SIZE];
    argon2.hash_password_into(password.as_bytes(), salt, &mut key_bytes)?;
    Ok(Key::from_bytes(key_bytes))
}
