//! Vault (C3): DEK lifecycle, KEK wrap/unwrap, lock/unlock, panic wipe, and
//! anti-brute-force lockout. Grounded on the teacher crate's
//! `EncryptionKey` (zeroize-on-drop key type, Argon2id derivation) and
//! `BlobStore` (single `RwLock`-guarded piece of long-lived server state),
//! generalized from a one-shot in-memory key to a disk-persisted,
//! lock/unlock state machine.

use crate::crypto::{self, Key, NONCE_SIZE, SALT_SIZE};
use crate::error::EceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const MAX_FAILED_UNLOCKS: u32 = 5;
const LOCKOUT_DURATION: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Serialize, Deserialize, Clone)]
struct VaultConfigFile {
    algorithm: String,
    kdf: String,
    version: u8,
}

impl Default for VaultConfigFile {
    fn default() -> Self {
        Self {
            algorithm: "xchacha20poly1305".to_string(),
            kdf: "argon2id".to_string(),
            version: 1,
        }
    }
}

enum VaultPhase {
    Uninitialized,
    Locked,
    Unlocked(Key),
}

struct VaultInner {
    phase: VaultPhase,
    failed_unlocks: u32,
    lockout_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct VaultStatus {
    pub configured: bool,
    pub locked: bool,
}

pub struct Vault {
    dir: PathBuf,
    inner: RwLock<VaultInner>,
}

impl Vault {
    pub fn new(dir: PathBuf) -> Self {
        let configured = salt_path(&dir).exists() && config_path(&dir).exists() && dek_path(&dir).exists();
        Self {
            dir,
            inner: RwLock::new(VaultInner {
                phase: if configured { VaultPhase::Locked } else { VaultPhase::Uninitialized },
                failed_unlocks: 0,
                lockout_until: None,
            }),
        }
    }

    pub fn is_configured(&self) -> bool {
        salt_path(&self.dir).exists() && config_path(&self.dir).exists() && dek_path(&self.dir).exists()
    }

    pub async fn status(&self) -> VaultStatus {
        let inner = self.inner.read().await;
        VaultStatus {
            configured: self.is_configured(),
            locked: !matches!(inner.phase, VaultPhase::Unlocked(_)),
        }
    }

    /// Create a brand-new vault. Refuses if one is already configured on disk.
    pub async fn setup(&self, password: &str) -> Result<(), EceError> {
        if self.is_configured() {
            return Err(EceError::BadRequest("vault already configured".to_string()));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| EceError::Internal(e.to_string()))?;
        set_restrictive_permissions(&self.dir);

        let salt = crypto::random_bytes::<SALT_SIZE>();
        let dek = Key::generate();

        // Argon2id is a long CPU burst; derive before touching shared state.
        let kek = crypto::derive_key(password, &salt).map_err(|e| EceError::Internal(e.to_string()))?;

        let nonce = crypto::random_bytes::<NONCE_SIZE>();
        let sealed = crypto::seal_chunk(&kek, &nonce, &dek.0)?;
        let mut encrypted_dek = Vec::with_capacity(NONCE_SIZE + sealed.len());
        encrypted_dek.extend_from_slice(&nonce);
        encrypted_dek.extend_from_slice(&sealed);

        let config = VaultConfigFile { version: 2, ..Default::default() };
        let config_bytes = serde_json::to_vec_pretty(&config).map_err(|e| EceError::Internal(e.to_string()))?;

        write_atomic(&salt_path(&self.dir), &salt)?;
        write_atomic(&config_path(&self.dir), &config_bytes)?;
        write_atomic(&dek_path(&self.dir), &encrypted_dek)?;

        let mut inner = self.inner.write().await;
        inner.phase = VaultPhase::Unlocked(dek);
        inner.failed_unlocks = 0;
        inner.lockout_until = None;
        Ok(())
    }

    /// Unlock with a password. On repeated failure, locks out further
    /// attempts for `LOCKOUT_DURATION` after the fifth consecutive failure.
    pub async fn unlock(&self, password: &str) -> Result<(), EceError> {
        {
            let inner = self.inner.read().await;
            if let Some(until) = inner.lockout_until {
                if Utc::now() < until {
                    return Err(EceError::VaultLocked);
                }
            }
        }

        if !self.is_configured() {
            return Err(EceError::BadRequest("vault is not configured".to_string()));
        }

        let salt = read_salt(&self.dir)?;
        let encrypted_dek = read_encrypted_dek(&self.dir)?;
        if encrypted_dek.len() < NONCE_SIZE {
            return Err(EceError::CorruptedData);
        }
        let (nonce_bytes, sealed) = encrypted_dek.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        // Derive outside the lock: this is the expensive step.
        let kek = crypto::derive_key(password, &salt).map_err(|e| EceError::Internal(e.to_string()))?;

        match crypto::open_chunk(&kek, &nonce, sealed) {
            Ok(dek_bytes) => {
                let mut dek = [0u8; crypto::KEY_SIZE];
                dek.copy_from_slice(&dek_bytes);
                let mut inner = self.inner.write().await;
                inner.phase = VaultPhase::Unlocked(Key::from_bytes(dek));
                inner.failed_unlocks = 0;
                inner.lockout_until = None;
                Ok(())
            }
            Err(_) => {
                let mut inner = self.inner.write().await;
                inner.failed_unlocks += 1;
                if inner.failed_unlocks >= MAX_FAILED_UNLOCKS {
                    inner.lockout_until = Some(Utc::now() + LOCKOUT_DURATION);
                }
                Err(EceError::InvalidPassword)
            }
        }
    }

    /// Wipe the in-memory DEK (two-pass overwrite) and return to Locked.
    pub async fn lock(&self) -> Result<(), EceError> {
        let mut inner = self.inner.write().await;
        match &mut inner.phase {
            VaultPhase::Unlocked(key) => {
                secure_wipe_two_pass(&mut key.0);
                inner.phase = VaultPhase::Locked;
                Ok(())
            }
            _ => Err(EceError::BadRequest("vault is not unlocked".to_string())),
        }
    }

    /// Wipe in-memory key material (if any) and erase all on-disk vault
    /// state. After this call `is_configured()` is false. Callers are
    /// responsible for gating this on an admin role.
    pub async fn panic(&self) -> Result<(), EceError> {
        let mut inner = self.inner.write().await;
        if let VaultPhase::Unlocked(key) = &mut inner.phase {
            secure_wipe_two_pass(&mut key.0);
        }
        inner.phase = VaultPhase::Uninitialized;
        inner.failed_unlocks = 0;
        inner.lockout_until = None;

        for path in [dek_path(&self.dir), salt_path(&self.dir), config_path(&self.dir)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| EceError::Internal(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Small-payload AEAD using the DEK directly (operational metadata,
    /// not container files). Returns nonce-prepended ciphertext.
    pub async fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, EceError> {
        let inner = self.inner.read().await;
        match &inner.phase {
            VaultPhase::Unlocked(key) => {
                let nonce = crypto::random_bytes::<NONCE_SIZE>();
                let sealed = crypto::seal_chunk(key, &nonce, plaintext)?;
                let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
            _ => Err(EceError::VaultLocked),
        }
    }

    pub async fn decrypt_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EceError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(EceError::CorruptedData);
        }
        let inner = self.inner.read().await;
        match &inner.phase {
            VaultPhase::Unlocked(key) => {
                let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
                let mut nonce = [0u8; NONCE_SIZE];
                nonce.copy_from_slice(nonce_bytes);
                crypto::open_chunk(key, &nonce, sealed)
            }
            _ => Err(EceError::VaultLocked),
        }
    }

    /// Returns (salt, config) bytes for offline backup. Never returns the
    /// wrapped DEK; restoring from backup still requires the password.
    pub fn get_vault_config_files(&self) -> Result<(Vec<u8>, Vec<u8>), EceError> {
        let salt = std::fs::read(salt_path(&self.dir)).map_err(|e| EceError::Internal(e.to_string()))?;
        let config = std::fs::read(config_path(&self.dir)).map_err(|e| EceError::Internal(e.to_string()))?;
        Ok((salt, config))
    }

    /// Clone the DEK out for container-file crypto, if unlocked.
    pub async fn current_dek(&self) -> Option<Key> {
        let inner = self.inner.read().await;
        match &inner.phase {
            VaultPhase::Unlocked(key) => Some(key.clone()),
            _ => None,
        }
    }
}

fn secure_wipe_two_pass(buf: &mut [u8]) {
    buf.fill(0xFF);
    buf.fill(0x00);
}

fn salt_path(dir: &Path) -> PathBuf {
    dir.join("salt")
}
fn config_path(dir: &Path) -> PathBuf {
    dir.join("config")
}
fn dek_path(dir: &Path) -> PathBuf {
    dir.join("encrypted_dek")
}

fn read_salt(dir: &Path) -> Result<[u8; SALT_SIZE], EceError> {
    let bytes = std::fs::read(salt_path(dir)).map_err(|e| EceError::Internal(e.to_string()))?;
    if bytes.len() != SALT_SIZE {
        return Err(EceError::CorruptedData);
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

fn read_encrypted_dek(dir: &Path) -> Result<Vec<u8>, EceError> {
    std::fs::read(dek_path(dir)).map_err(|e| EceError::Internal(e.to_string()))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), EceError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data).map_err(|e| EceError::Internal(e.to_string()))?;
    std::fs::rename(&tmp_path, path).map_err(|e| EceError::Internal(e.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn set_restrictive_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(dir) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(dir, perms);
    }
}

#[cfg(not(unix))]
fn set_restrictive_permissions(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn two_pass_wipe_leaves_buffer_zeroed() {
        let mut buf = [0xABu8; 32];
        secure_wipe_two_pass(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn setup_then_unlock_round_trips() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        assert!(!vault.is_configured());

        vault.setup("correct horse battery staple").await.unwrap();
        assert!(vault.is_configured());
        assert!(!vault.status().await.locked);

        vault.lock().await.unwrap();
        assert!(vault.status().await.locked);

        vault.unlock("correct horse battery staple").await.unwrap();
        assert!(!vault.status().await.locked);
    }

    #[tokio::test]
    async fn setup_twice_is_refused() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.setup("pw").await.unwrap();
        let result = vault.setup("pw2").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn five_failed_unlocks_trigger_lockout() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.setup("right-password").await.unwrap();
        vault.lock().await.unwrap();

        for _ in 0..5 {
            let result = vault.unlock("wrong-password").await;
            assert!(matches!(result, Err(EceError::InvalidPassword)));
        }

        let result = vault.unlock("right-password").await;
        assert!(matches!(result, Err(EceError::VaultLocked)));
    }

    #[tokio::test]
    async fn panic_erases_disk_state_and_blocks_unlock() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.setup("pw").await.unwrap();
        vault.panic().await.unwrap();

        assert!(!vault.is_configured());
        let result = vault.unlock("pw").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn encrypt_data_requires_unlocked_vault() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.setup("pw").await.unwrap();
        vault.lock().await.unwrap();

        let result = vault.encrypt_data(b"metadata").await;
        assert!(matches!(result, Err(EceError::VaultLocked)));

        vault.unlock("pw").await.unwrap();
        let ciphertext = vault.encrypt_data(b"metadata").await.unwrap();
        let plaintext = vault.decrypt_data(&ciphertext).await.unwrap();
        assert_eq!(plaintext, b"metadata");
    }

    #[tokio::test]
    async fn get_vault_config_files_never_returns_the_wrapped_dek() {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path().to_path_buf());
        vault.setup("pw").await.unwrap();

        let (salt, config) = vault.get_vault_config_files().unwrap();
        assert_eq!(salt.len(), SALT_SIZE);
        assert!(!config.is_empty());
    }
}
