//! Safe ZIP archive extraction, the inverse of the teacher's
//! `archive.rs::compress_folder` (which walks a directory into a
//! `tar.gz`). Extraction is the riskier direction — a hostile archive can
//! claim any path or any decompressed size — so this module enforces hard
//! caps and path containment the compression side never needed.
//!
//! `zip` is a new dependency (none of the pack teachers ingest archives,
//! only the occasional one produces them with `tar`/`flate2`); it's the
//! standard ecosystem crate for reading the zip format, same role `tar`
//! plays for the teacher's write path.

use crate::error::EceError;
use crate::storage::Storage;
use std::path::PathBuf;

const MAX_ENTRIES: usize = 10_000;
const MAX_SINGLE_FILE_BYTES: u64 = 500 * 1024 * 1024;
const MAX_TOTAL_UNCOMPRESSED_BYTES: u64 = 1024 * 1024 * 1024;
const MAX_COMPRESSION_RATIO: u64 = 100;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExtractSummary {
    pub entries_extracted: usize,
    pub total_uncompressed_bytes: u64,
}

/// Extract `zip_path` into `dest_relative` under `storage`'s base
/// directory. Rejects anything that looks like a zip bomb or a
/// path-escaping entry before writing a single byte of it.
pub async fn extract_zip(
    storage: &Storage,
    zip_path: &std::path::Path,
    dest_relative: &str,
) -> Result<ExtractSummary, EceError> {
    let mut magic = [0u8; 4];
    {
        use std::io::Read as _;
        let mut f = std::fs::File::open(zip_path).map_err(|e| EceError::Internal(e.to_string()))?;
        if f.read_exact(&mut magic).is_err() || magic != ZIP_MAGIC {
            return Err(EceError::BadRequest("not a zip archive".to_string()));
        }
    }

    let dest_root = storage.resolve(dest_relative)?;
    let zip_path = zip_path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip_blocking(&zip_path, &dest_root))
        .await
        .map_err(|e| EceError::Internal(e.to_string()))?
}

fn extract_zip_blocking(zip_path: &std::path::Path, dest_root: &std::path::Path) -> Result<ExtractSummary, EceError> {
    let file = std::fs::File::open(zip_path).map_err(|e| EceError::Internal(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| EceError::BadRequest(e.to_string()))?;

    if archive.len() > MAX_ENTRIES {
        return Err(EceError::BadRequest(format!("archive has more than {} entries", MAX_ENTRIES)));
    }

    std::fs::create_dir_all(dest_root).map_err(|e| EceError::Internal(e.to_string()))?;

    let mut total_uncompressed: u64 = 0;
    let mut extracted = 0usize;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| EceError::BadRequest(e.to_string()))?;

        let enclosed = entry
            .enclosed_name()
            .ok_or_else(|| EceError::InvalidPath(format!("unsafe entry path: {}", entry.name())))?;

        if is_symlink_entry(&entry) {
            return Err(EceError::InvalidPath(format!("symlink entries are refused: {}", entry.name())));
        }

        let uncompressed_size = entry.size();
        let compressed_size = entry.compressed_size().max(1);
        if uncompressed_size > MAX_SINGLE_FILE_BYTES {
            return Err(EceError::BadRequest(format!("entry {} exceeds per-file cap", entry.name())));
        }
        if uncompressed_size / compressed_size > MAX_COMPRESSION_RATIO {
            return Err(EceError::BadRequest(format!("entry {} exceeds compression ratio cap", entry.name())));
        }
        total_uncompressed += uncompressed_size;
        if total_uncompressed > MAX_TOTAL_UNCOMPRESSED_BYTES {
            return Err(EceError::BadRequest("archive exceeds total uncompressed cap".to_string()));
        }

        let out_path: PathBuf = dest_root.join(&enclosed);
        if !out_path.starts_with(dest_root) {
            return Err(EceError::InvalidPath(format!("entry escapes destination: {}", entry.name())));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| EceError::Internal(e.to_string()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EceError::Internal(e.to_string()))?;
        }
        let mut out_file = std::fs::File::create(&out_path).map_err(|e| EceError::Internal(e.to_string()))?;
        std::io::copy(&mut entry, &mut out_file).map_err(|e| EceError::Internal(e.to_string()))?;
        force_safe_permissions(&out_path);
        extracted += 1;
    }

    Ok(ExtractSummary { entries_extracted: extracted, total_uncompressed_bytes: total_uncompressed })
}

fn is_symlink_entry(entry: &zip::read::ZipFile<'_>) -> bool {
    const S_IFLNK: u32 = 0o120000;
    entry.unix_mode().map(|mode| mode & 0o170000 == S_IFLNK).unwrap_or(false)
}

#[cfg(unix)]
fn force_safe_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
}

#[cfg(not(unix))]
fn force_safe_permissions(_path: &std::path::Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn extracts_well_formed_archive() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        let zip_bytes = build_zip(&[("a.txt", b"hello"), ("nested/b.txt", b"world")]);
        let zip_path = dir.path().join("in.zip");
        std::fs::write(&zip_path, &zip_bytes).unwrap();

        let summary = extract_zip(&storage, &zip_path, "out").await.unwrap();
        assert_eq!(summary.entries_extracted, 2);

        let a = std::fs::read(dir.path().join("out/a.txt")).unwrap();
        assert_eq!(a, b"hello");
        let b = std::fs::read(dir.path().join("out/nested/b.txt")).unwrap();
        assert_eq!(b, b"world");
    }

    #[tokio::test]
    async fn rejects_non_zip_input() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        let fake_path = dir.path().join("fake.zip");
        std::fs::write(&fake_path, b"not a zip file at all").unwrap();

        let result = extract_zip(&storage, &fake_path, "out").await;
        assert!(matches!(result, Err(EceError::BadRequest(_))));
    }

    #[tokio::test]
    async fn rejects_path_escaping_entry() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());
        let zip_bytes = build_zip(&[("../../escape.txt", b"pwned")]);
        let zip_path = dir.path().join("in.zip");
        std::fs::write(&zip_path, &zip_bytes).unwrap();

        let result = extract_zip(&storage, &zip_path, "out").await;
        assert!(result.is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }
}
