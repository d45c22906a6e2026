//! Process configuration: base data directory, vault directory, offload
//! behavior, and the subdirectory names the storage backend and upload
//! coordinator use.

use anyhow::{Result, anyhow};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EceConfig {
    /// Base data directory all storage paths are resolved relative to.
    pub base_dir: PathBuf,
    /// Vault directory; may be a tmpfs mount for zero-knowledge deployments.
    pub vault_dir: PathBuf,
    /// Enable X-Accel-Redirect offload for cleartext files.
    pub offload_enabled: bool,
    /// Maps the base directory to the proxy's internal location prefix.
    pub offload_prefix: String,
    /// Maximum accepted size for server-side (non-chunked) uploads.
    pub upload_cap_bytes: u64,
    /// Name of the hidden subdirectory used for in-flight chunked uploads.
    pub uploads_subdir: String,
    /// Name of the hidden subdirectory used for soft-deleted files.
    pub trash_subdir: String,
    /// Accept `FinalizeUpload` calls whose received size does not match the
    /// declared expected size (spec §9 Open Question (a), default accept).
    pub reject_on_size_mismatch: bool,
    /// Address to bind the HTTP listener to.
    pub bind: String,
    pub port: u16,
}

impl EceConfig {
    pub fn new(
        base_dir: PathBuf,
        vault_dir: PathBuf,
        offload_enabled: bool,
        offload_prefix: String,
        upload_cap_bytes: u64,
        bind: String,
        port: u16,
    ) -> Result<Self> {
        if !base_dir.is_absolute() {
            return Err(anyhow!("base_dir must be an absolute path"));
        }
        if !vault_dir.is_absolute() {
            return Err(anyhow!("vault_dir must be an absolute path"));
        }

        Ok(Self {
            base_dir,
            vault_dir,
            offload_enabled,
            offload_prefix,
            upload_cap_bytes,
            uploads_subdir: ".uploads".to_string(),
            trash_subdir: ".trash".to_string(),
            reject_on_size_mismatch: false,
            bind,
            port,
        })
    }

    /// Load from environment variables, falling back to sane defaults for
    /// local development. CLI flags (see `main.rs`) take precedence.
    pub fn from_env() -> Result<Self> {
        let base_dir = std::env::var("ECE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("nas-ece").join("data"));
        let vault_dir = std::env::var("ECE_VAULT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("nas-ece").join("vault"));
        let offload_enabled = std::env::var("ECE_OFFLOAD_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let offload_prefix =
            std::env::var("ECE_OFFLOAD_PREFIX").unwrap_or_else(|_| "/_internal".to_string());
        let upload_cap_bytes: u64 = std::env::var("ECE_UPLOAD_CAP_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2 * 1024 * 1024 * 1024);
        let bind = std::env::var("ECE_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = std::env::var("ECE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        std::fs::create_dir_all(&base_dir)?;
        std::fs::create_dir_all(&vault_dir)?;

        Self::new(
            base_dir,
            vault_dir,
            offload_enabled,
            offload_prefix,
            upload_cap_bytes,
            bind,
            port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_base_dir() {
        let result = EceConfig::new(
            PathBuf::from("relative/path"),
            PathBuf::from("/tmp/vault"),
            false,
            "/_internal".to_string(),
            1024,
            "0.0.0.0".to_string(),
            8080,
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_absolute_dirs() {
        let result = EceConfig::new(
            PathBuf::from("/tmp/ece-base"),
            PathBuf::from("/tmp/ece-vault"),
            false,
            "/_internal".to_string(),
            1024,
            "0.0.0.0".to_string(),
            8080,
        );
        assert!(result.is_ok());
    }
}
