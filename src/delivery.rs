//! Content delivery (C5): decides whether a requested path is served raw,
//! offloaded to the reverse proxy, or transparently decrypted, and honors
//! HTTP range semantics over the *plaintext* regardless of which path was
//! taken. Grounded on the teacher's `drop` HTTP handlers (header table,
//! range parsing shape) generalized from "one ephemeral drop" to "any file
//! in the tree, maybe a NASC container".

use crate::collaborators::{AuthContext, HoneyfileGuard};
use crate::container;
use crate::crypto::BufferPools;
use crate::error::EceError;
use crate::storage::Storage;
use crate::vault::Vault;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

const MAGIC_PROBE_LEN: usize = container::HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedMode {
    Raw,
    Encrypted,
}

pub struct DeliveredContent {
    pub status: u16,
    pub content_type: String,
    pub content_length: u64,
    pub content_range: Option<String>,
    pub accept_ranges: bool,
    pub body: Vec<u8>,
}

pub enum DeliveryOutcome {
    /// Hand the request to the reverse proxy via an internal redirect
    /// instead of streaming bytes through this process.
    Offload { internal_path: String, content_type: String },
    Inline(DeliveredContent),
}

/// Sniff whether `relative_path` names a NASC container: `.enc` suffix
/// plus a magic/version match on the first header bytes. Any I/O failure
/// during the sniff fails open to `Raw` — a download should never 500
/// just because the probe read failed, and the container decode path
/// will report whatever error fits once it actually tries to read.
async fn detect_mode(storage: &Storage, relative_path: &str) -> DetectedMode {
    if !relative_path.ends_with(".enc") {
        return DetectedMode::Raw;
    }
    let Ok(mut file) = storage.open(relative_path).await else {
        return DetectedMode::Raw;
    };
    let mut probe = [0u8; MAGIC_PROBE_LEN];
    match file.read_exact(&mut probe).await {
        Ok(_) if &probe[0..4] == container::MAGIC && probe[4] == container::VERSION => DetectedMode::Encrypted,
        _ => DetectedMode::Raw,
    }
}

/// An inclusive byte range, `start..=end`, resolved against a total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a `Range: bytes=...` header against `total_size`. Returns `None`
/// when no range was requested (serve the whole resource). Rejects
/// multi-range requests and out-of-bounds ranges with
/// `EceError::RangeNotSatisfiable`.
pub fn parse_range(header: Option<&str>, total_size: u64) -> Result<Option<ByteRange>, EceError> {
    let Some(header) = header else { return Ok(None) };
    let spec = header
        .strip_prefix("bytes=")
        .ok_or(EceError::RangeNotSatisfiable { resource_size: total_size })?;

    if spec.contains(',') {
        return Err(EceError::RangeNotSatisfiable { resource_size: total_size });
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or(EceError::RangeNotSatisfiable { resource_size: total_size })?;

    let range = if start_str.is_empty() {
        // suffix range: "-N" means the last N bytes
        let suffix_len: u64 = end_str
            .parse()
            .map_err(|_| EceError::RangeNotSatisfiable { resource_size: total_size })?;
        if suffix_len == 0 || total_size == 0 {
            return Err(EceError::RangeNotSatisfiable { resource_size: total_size });
        }
        let start = total_size.saturating_sub(suffix_len);
        ByteRange { start, end: total_size - 1 }
    } else {
        let start: u64 = start_str
            .parse()
            .map_err(|_| EceError::RangeNotSatisfiable { resource_size: total_size })?;
        let end = if end_str.is_empty() {
            total_size.saturating_sub(1)
        } else {
            end_str
                .parse()
                .map_err(|_| EceError::RangeNotSatisfiable { resource_size: total_size })?
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.end >= total_size {
        return Err(EceError::RangeNotSatisfiable { resource_size: total_size });
    }
    Ok(Some(range))
}

#[allow(clippy::too_many_arguments)]
pub async fn get_stream(
    storage: &Storage,
    relative_path: &str,
    range_header: Option<&str>,
    password: Option<&str>,
    mode: Option<&str>,
    vault: &Vault,
    honeyfiles: &dyn HoneyfileGuard,
    auth: &AuthContext,
    pools: &BufferPools,
    offload_enabled: bool,
    offload_prefix: &str,
) -> Result<DeliveryOutcome, EceError> {
    if honeyfiles.is_honeyfile(relative_path).await {
        honeyfiles.record_trip(relative_path, auth).await;
        return Err(EceError::Forbidden("access denied".to_string()));
    }

    match detect_mode(storage, relative_path).await {
        DetectedMode::Encrypted if mode == Some("raw") => {
            stream_bytes_as(storage, relative_path, range_header, "application/octet-stream".to_string()).await
        }
        DetectedMode::Encrypted => deliver_encrypted(storage, relative_path, range_header, password, vault, pools).await,
        DetectedMode::Raw => deliver_raw(storage, relative_path, range_header, offload_enabled, offload_prefix).await,
    }
}

async fn deliver_encrypted(
    storage: &Storage,
    relative_path: &str,
    range_header: Option<&str>,
    password: Option<&str>,
    vault: &Vault,
    pools: &BufferPools,
) -> Result<DeliveryOutcome, EceError> {
    let mut file = storage.open(relative_path).await?;
    let info = container::get_encrypted_file_info(&mut file).await?;
    if !info.valid {
        return Err(EceError::InvalidHeader);
    }
    let total_size = info.estimated_plain_size;

    let range = parse_range(range_header, total_size)?;
    let (start, len, status) = match range {
        Some(r) => (r.start, r.len(), 206u16),
        None => (0, total_size, 200u16),
    };

    let mut plaintext = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await.map_err(|e| EceError::Internal(e.to_string()))?;

    match password {
        Some(password) => {
            container::decrypt_stream_with_seek(password, &mut file, &mut plaintext, start, len, pools).await?;
        }
        None if vault.is_configured() => {
            let key = vault.current_dek().await.ok_or(EceError::VaultLocked)?;
            container::decrypt_stream_with_seek_with_key(&key, &mut file, &mut plaintext, start, len, pools).await?;
        }
        None => return Err(EceError::PasswordRequired),
    }

    let content_type = content_type_for(relative_path.trim_end_matches(".enc"));
    let content_range = range.map(|r| format!("bytes {}-{}/{}", r.start, r.end, total_size));

    Ok(DeliveryOutcome::Inline(DeliveredContent {
        status,
        content_type,
        content_length: plaintext.len() as u64,
        content_range,
        accept_ranges: true,
        body: plaintext,
    }))
}

async fn deliver_raw(
    storage: &Storage,
    relative_path: &str,
    range_header: Option<&str>,
    offload_enabled: bool,
    offload_prefix: &str,
) -> Result<DeliveryOutcome, EceError> {
    if offload_enabled && range_header.is_none() {
        return Ok(DeliveryOutcome::Offload {
            internal_path: format!("{}/{}", offload_prefix.trim_end_matches('/'), relative_path),
            content_type: content_type_for(relative_path),
        });
    }

    stream_bytes_as(storage, relative_path, range_header, content_type_for(relative_path)).await
}

/// Read `relative_path`'s raw bytes (no decryption), honoring `Range`,
/// under the given `content_type`. Shared by plain-file delivery and the
/// `mode=raw` ciphertext-passthrough path for encrypted containers.
async fn stream_bytes_as(
    storage: &Storage,
    relative_path: &str,
    range_header: Option<&str>,
    content_type: String,
) -> Result<DeliveryOutcome, EceError> {
    let mut file = storage.open(relative_path).await?;
    let total_size = file.metadata().await.map_err(|e| EceError::Internal(e.to_string()))?.len();
    let range = parse_range(range_header, total_size)?;
    let (start, len, status) = match range {
        Some(r) => (r.start, r.len(), 206u16),
        None => (0, total_size, 200u16),
    };

    file.seek(SeekFrom::Start(start)).await.map_err(|e| EceError::Internal(e.to_string()))?;
    let mut body = vec![0u8; len as usize];
    file.read_exact(&mut body).await.map_err(|e| EceError::Internal(e.to_string()))?;

    let content_range = range.map(|r| format!("bytes {}-{}/{}", r.start, r.end, total_size));
    Ok(DeliveryOutcome::Inline(DeliveredContent {
        status,
        content_type,
        content_length: body.len() as u64,
        content_range,
        accept_ranges: true,
        body,
    }))
}

fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoHoneyfiles;
    use tempfile::tempdir;

    #[test]
    fn parses_simple_range() {
        let range = parse_range(Some("bytes=0-99"), 1000).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 99 });
    }

    #[test]
    fn parses_open_ended_range() {
        let range = parse_range(Some("bytes=500-"), 1000).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 500, end: 999 });
    }

    #[test]
    fn parses_suffix_range() {
        let range = parse_range(Some("bytes=-100"), 1000).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 900, end: 999 });
    }

    #[test]
    fn rejects_multi_range() {
        let result = parse_range(Some("bytes=0-10,20-30"), 1000);
        assert!(matches!(result, Err(EceError::RangeNotSatisfiable { .. })));
    }

    #[test]
    fn rejects_out_of_bounds_range() {
        let result = parse_range(Some("bytes=0-9999"), 1000);
        assert!(matches!(result, Err(EceError::RangeNotSatisfiable { .. })));
    }

    #[test]
    fn no_header_means_whole_resource() {
        assert_eq!(parse_range(None, 1000).unwrap(), None);
    }

    #[tokio::test]
    async fn delivers_raw_file_whole() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        storage.write_file("notes.txt", std::io::Cursor::new(b"hello world".to_vec())).await.unwrap();

        let pools = BufferPools::new();
        let vault = Vault::new(dir.path().join("vault"));
        let outcome = get_stream(
            &storage,
            "notes.txt",
            None,
            None,
            None,
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await
        .unwrap();

        match outcome {
            DeliveryOutcome::Inline(content) => {
                assert_eq!(content.body, b"hello world");
                assert_eq!(content.status, 200);
            }
            _ => panic!("expected inline delivery"),
        }
    }

    #[tokio::test]
    async fn delivers_raw_file_range() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        storage.write_file("notes.txt", std::io::Cursor::new(b"0123456789".to_vec())).await.unwrap();

        let pools = BufferPools::new();
        let vault = Vault::new(dir.path().join("vault"));
        let outcome = get_stream(
            &storage,
            "notes.txt",
            Some("bytes=2-5"),
            None,
            None,
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await
        .unwrap();

        match outcome {
            DeliveryOutcome::Inline(content) => {
                assert_eq!(content.body, b"2345");
                assert_eq!(content.status, 206);
                assert_eq!(content.content_range.as_deref(), Some("bytes 2-5/10"));
            }
            _ => panic!("expected inline delivery"),
        }
    }

    #[tokio::test]
    async fn encrypted_container_requires_password() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let pools = BufferPools::new();
        let mut container = Vec::new();
        let mut reader = std::io::Cursor::new(b"top secret".to_vec());
        container::encrypt_stream("pw", &mut reader, &mut container, &pools).await.unwrap();
        storage.write_file("secret.txt.enc", std::io::Cursor::new(container)).await.unwrap();

        let vault = Vault::new(dir.path().join("vault"));
        let result = get_stream(
            &storage,
            "secret.txt.enc",
            None,
            None,
            None,
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await;
        assert!(matches!(result, Err(EceError::PasswordRequired)));
    }

    #[tokio::test]
    async fn encrypted_container_returns_vault_locked_when_configured_but_locked() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let pools = BufferPools::new();
        let mut container = Vec::new();
        let mut reader = std::io::Cursor::new(b"top secret".to_vec());
        container::encrypt_stream("pw", &mut reader, &mut container, &pools).await.unwrap();
        storage.write_file("secret.txt.enc", std::io::Cursor::new(container)).await.unwrap();

        let vault = Vault::new(dir.path().join("vault"));
        vault.setup("vault-password").await.unwrap();
        vault.lock().await.unwrap();

        let result = get_stream(
            &storage,
            "secret.txt.enc",
            None,
            None,
            None,
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await;
        assert!(matches!(result, Err(EceError::VaultLocked)));
    }

    #[tokio::test]
    async fn mode_raw_streams_ciphertext_ignoring_password() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let pools = BufferPools::new();
        let mut container = Vec::new();
        let mut reader = std::io::Cursor::new(b"top secret payload".to_vec());
        container::encrypt_stream("pw", &mut reader, &mut container, &pools).await.unwrap();
        storage.write_file("secret.txt.enc", std::io::Cursor::new(container.clone())).await.unwrap();

        let vault = Vault::new(dir.path().join("vault"));
        let outcome = get_stream(
            &storage,
            "secret.txt.enc",
            None,
            None,
            Some("raw"),
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await
        .unwrap();

        match outcome {
            DeliveryOutcome::Inline(content) => {
                assert_eq!(content.body, container);
                assert_eq!(content.content_type, "application/octet-stream");
            }
            _ => panic!("expected inline delivery"),
        }
    }

    #[tokio::test]
    async fn encrypted_container_decrypts_with_correct_password() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let pools = BufferPools::new();
        let mut container = Vec::new();
        let mut reader = std::io::Cursor::new(b"top secret payload".to_vec());
        container::encrypt_stream("pw", &mut reader, &mut container, &pools).await.unwrap();
        storage.write_file("secret.txt.enc", std::io::Cursor::new(container)).await.unwrap();

        let vault = Vault::new(dir.path().join("vault"));
        let outcome = get_stream(
            &storage,
            "secret.txt.enc",
            None,
            Some("pw"),
            None,
            &vault,
            &NoHoneyfiles,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await
        .unwrap();

        match outcome {
            DeliveryOutcome::Inline(content) => assert_eq!(content.body, b"top secret payload"),
            _ => panic!("expected inline delivery"),
        }
    }

    #[tokio::test]
    async fn honeyfile_trip_is_forbidden() {
        struct AlwaysHoney;
        #[async_trait::async_trait]
        impl HoneyfileGuard for AlwaysHoney {
            async fn is_honeyfile(&self, _relative_path: &str) -> bool {
                true
            }
        }

        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        storage.write_file("decoy.txt", std::io::Cursor::new(b"bait".to_vec())).await.unwrap();

        let pools = BufferPools::new();
        let vault = Vault::new(dir.path().join("vault"));
        let result = get_stream(
            &storage,
            "decoy.txt",
            None,
            None,
            None,
            &vault,
            &AlwaysHoney,
            &crate::collaborators::AuthContext::anonymous(),
            &pools,
            false,
            "/internal",
        )
        .await;
        assert!(matches!(result, Err(EceError::Forbidden(_))));
    }
}
