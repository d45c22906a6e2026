//! Storage backend (C4): path sandboxing, filesystem CRUD, trash, and
//! version rotation. All external paths are treated as relative to a
//! single base directory; nothing here trusts a caller-supplied absolute
//! path. Grounded on the teacher crate's `archive.rs` traversal guard
//! (`name_str.starts_with('.')`, symlinks skipped during directory walks)
//! generalized into the spec's full path-containment contract.

use crate::error::EceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

#[derive(Debug, Clone, Serialize)]
pub struct StorageEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrashEntry {
    pub id: String,
    pub name: String,
    pub original_path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

pub struct Storage {
    base_dir: PathBuf,
    trash_subdir: String,
}

impl Storage {
    pub fn new(base_dir: PathBuf, trash_subdir: String) -> Self {
        Self { base_dir, trash_subdir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a caller-supplied relative path to an absolute path that is
    /// lexically contained in the base directory, rejecting `..`, NUL
    /// bytes, and symlinks that escape the base.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, EceError> {
        if relative.as_bytes().contains(&0) {
            return Err(EceError::InvalidPath("embedded NUL byte".to_string()));
        }

        let mut cleaned = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(EceError::InvalidPath("path traversal".to_string()));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EceError::InvalidPath("absolute path not allowed".to_string()));
                }
            }
        }

        let full = self.base_dir.join(&cleaned);
        if !full.starts_with(&self.base_dir) {
            return Err(EceError::InvalidPath("escapes base directory".to_string()));
        }

        self.reject_symlink_escape(&full)?;
        Ok(full)
    }

    /// Walks up from `full` to the nearest ancestor that exists on disk,
    /// canonicalizes it, and checks that canonical form is still under the
    /// canonical base directory. Catches a symlinked intermediate
    /// directory pointing outside the base even though the lexical join
    /// above looked safe.
    fn reject_symlink_escape(&self, full: &Path) -> Result<(), EceError> {
        let canonical_base = match std::fs::canonicalize(&self.base_dir) {
            Ok(p) => p,
            Err(_) => return Ok(()), // base doesn't exist yet; nothing to escape into
        };

        let mut ancestor = full.to_path_buf();
        loop {
            if ancestor.exists() {
                break;
            }
            if !ancestor.pop() || ancestor == Path::new("") {
                return Ok(());
            }
        }

        let canonical_ancestor =
            std::fs::canonicalize(&ancestor).map_err(|e| EceError::Internal(e.to_string()))?;
        if !canonical_ancestor.starts_with(&canonical_base) {
            return Err(EceError::InvalidPath("symlink escapes base directory".to_string()));
        }
        Ok(())
    }

    pub fn get_full_path(&self, relative: &str) -> Result<PathBuf, EceError> {
        self.resolve(relative)
    }

    pub async fn list(&self, relative: &str) -> Result<Vec<StorageEntry>, EceError> {
        let dir = self.resolve(relative)?;
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| EceError::NotFound(relative.to_string()))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| EceError::Internal(e.to_string()))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == self.trash_subdir || name.starts_with('.') {
                continue; // trash and hidden dirs (e.g. .uploads) never show up in listings
            }
            let metadata = entry.metadata().await.map_err(|e| EceError::Internal(e.to_string()))?;
            let mod_time = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let is_dir = metadata.is_dir();
            let mime_type = if is_dir {
                "inode/directory".to_string()
            } else {
                mime_guess::from_path(&name).first_or_octet_stream().to_string()
            };
            entries.push(StorageEntry {
                name,
                size: metadata.len(),
                is_dir,
                mod_time,
                mime_type,
            });
        }
        Ok(entries)
    }

    pub async fn open(&self, relative: &str) -> Result<tokio::fs::File, EceError> {
        let path = self.resolve(relative)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| EceError::NotFound(relative.to_string()))?;
        if metadata.is_dir() {
            return Err(EceError::BadRequest("path is a directory".to_string()));
        }
        tokio::fs::File::open(&path).await.map_err(|e| EceError::Internal(e.to_string()))
    }

    /// Write `reader` to `relative`, rotating up to 3 backups if a file
    /// already exists there.
    pub async fn write_file<R>(&self, relative: &str, mut reader: R) -> Result<u64, EceError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| EceError::Internal(e.to_string()))?;
        }
        if path.exists() {
            rotate_versions(&path)?;
        }

        let mut file = tokio::fs::File::create(&path).await.map_err(|e| EceError::Internal(e.to_string()))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| EceError::Internal(e.to_string()))?;
        file.flush().await.map_err(|e| EceError::Internal(e.to_string()))?;
        Ok(written)
    }

    /// Move `from` to `to`, rotating backups at the destination if it
    /// already exists. Used by upload finalize and general renames.
    pub async fn mv(&self, from: &str, to: &str) -> Result<(), EceError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| EceError::Internal(e.to_string()))?;
        }
        if dst.exists() {
            rotate_versions(&dst)?;
        }
        tokio::fs::rename(&src, &dst).await.map_err(|e| EceError::Internal(e.to_string()))
    }

    pub async fn mkdir(&self, relative: &str) -> Result<(), EceError> {
        let path = self.resolve(relative)?;
        tokio::fs::create_dir_all(&path).await.map_err(|e| EceError::Internal(e.to_string()))
    }

    /// Soft-delete: move `relative` under `.trash/<timestamp>/<relative>`.
    /// Returns an opaque id encoding enough to restore it later.
    pub async fn delete(&self, relative: &str) -> Result<String, EceError> {
        let src = self.resolve(relative)?;
        if !src.exists() {
            return Err(EceError::NotFound(relative.to_string()));
        }

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.fZ").to_string();
        let trash_relative = format!("{}/{}/{}", self.trash_subdir, timestamp, relative);
        let trash_path = self.resolve(&trash_relative)?;
        if let Some(parent) = trash_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| EceError::Internal(e.to_string()))?;
        }
        tokio::fs::rename(&src, &trash_path).await.map_err(|e| EceError::Internal(e.to_string()))?;

        Ok(format!("{}/{}", timestamp, relative))
    }

    pub async fn restore_from_trash(&self, id: &str) -> Result<(), EceError> {
        let (timestamp, original_relative) = split_trash_id(id)?;
        let trash_relative = format!("{}/{}/{}", self.trash_subdir, timestamp, original_relative);
        let trash_path = self.resolve(&trash_relative)?;
        let dst = self.resolve(original_relative)?;
        if !trash_path.exists() {
            return Err(EceError::NotFound(id.to_string()));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| EceError::Internal(e.to_string()))?;
        }
        if dst.exists() {
            rotate_versions(&dst)?;
        }
        tokio::fs::rename(&trash_path, &dst).await.map_err(|e| EceError::Internal(e.to_string()))
    }

    pub async fn delete_from_trash(&self, id: &str) -> Result<(), EceError> {
        let (timestamp, original_relative) = split_trash_id(id)?;
        let trash_relative = format!("{}/{}/{}", self.trash_subdir, timestamp, original_relative);
        let trash_path = self.resolve(&trash_relative)?;
        if !trash_path.exists() {
            return Err(EceError::NotFound(id.to_string()));
        }
        if trash_path.is_dir() {
            tokio::fs::remove_dir_all(&trash_path).await.map_err(|e| EceError::Internal(e.to_string()))
        } else {
            tokio::fs::remove_file(&trash_path).await.map_err(|e| EceError::Internal(e.to_string()))
        }
    }

    pub async fn list_trash(&self) -> Result<Vec<TrashEntry>, EceError> {
        let trash_root = self.base_dir.join(&self.trash_subdir);
        if !trash_root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut stamp_dirs = tokio::fs::read_dir(&trash_root).await.map_err(|e| EceError::Internal(e.to_string()))?;
        while let Some(stamp_entry) = stamp_dirs.next_entry().await.map_err(|e| EceError::Internal(e.to_string()))? {
            let timestamp = stamp_entry.file_name().to_string_lossy().to_string();
            let stamp_path = stamp_entry.path();
            if !stamp_path.is_dir() {
                continue;
            }
            walk_trash_subtree(&stamp_path, &stamp_path, &timestamp, &mut entries).await?;
        }
        Ok(entries)
    }
}

async fn walk_trash_subtree(
    root: &Path,
    current: &Path,
    timestamp: &str,
    out: &mut Vec<TrashEntry>,
) -> Result<(), EceError> {
    let mut read_dir = tokio::fs::read_dir(current).await.map_err(|e| EceError::Internal(e.to_string()))?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| EceError::Internal(e.to_string()))? {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| EceError::Internal(e.to_string()))?;
        if metadata.is_dir() {
            Box::pin(walk_trash_subtree(root, &path, timestamp, out)).await?;
            continue;
        }
        let relative_to_stamp = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().to_string();
        let name = entry.file_name().to_string_lossy().to_string();
        let mod_time = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        out.push(TrashEntry {
            id: format!("{}/{}", timestamp, relative_to_stamp),
            name,
            original_path: relative_to_stamp,
            size: metadata.len(),
            mod_time,
        });
    }
    Ok(())
}

fn split_trash_id(id: &str) -> Result<(&str, &str), EceError> {
    id.split_once('/')
        .ok_or_else(|| EceError::BadRequest("malformed trash id".to_string()))
}

/// `<name>.v3.bak` is dropped; `.v2.bak` -> `.v3.bak`; `.v1.bak` -> `.v2.bak`;
/// the current file -> `.v1.bak`.
fn rotate_versions(path: &Path) -> Result<(), EceError> {
    let v = |n: u8| -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(format!(".v{}.bak", n));
        PathBuf::from(p)
    };

    let (v1, v2, v3) = (v(1), v(2), v(3));
    if v3.exists() {
        std::fs::remove_file(&v3).map_err(|e| EceError::Internal(e.to_string()))?;
    }
    if v2.exists() {
        std::fs::rename(&v2, &v3).map_err(|e| EceError::Internal(e.to_string()))?;
    }
    if v1.exists() {
        std::fs::rename(&v1, &v2).map_err(|e| EceError::Internal(e.to_string()))?;
    }
    std::fs::rename(path, &v1).map_err(|e| EceError::Internal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage_at(dir: &Path) -> Storage {
        Storage::new(dir.to_path_buf(), ".trash".to_string())
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        assert!(matches!(storage.resolve("../etc/passwd"), Err(EceError::InvalidPath(_))));
    }

    #[test]
    fn rejects_embedded_nul() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        assert!(matches!(storage.resolve("foo\0bar"), Err(EceError::InvalidPath(_))));
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        assert!(matches!(storage.resolve("/etc/passwd"), Err(EceError::InvalidPath(_))));
    }

    #[test]
    fn accepts_nested_relative_path() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        let resolved = storage.resolve("a/b/c.txt").unwrap();
        assert!(resolved.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn write_then_overwrite_rotates_backups() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());

        storage.write_file("doc.txt", std::io::Cursor::new(b"v1".to_vec())).await.unwrap();
        storage.write_file("doc.txt", std::io::Cursor::new(b"v2".to_vec())).await.unwrap();
        storage.write_file("doc.txt", std::io::Cursor::new(b"v3".to_vec())).await.unwrap();
        storage.write_file("doc.txt", std::io::Cursor::new(b"v4".to_vec())).await.unwrap();

        let current = tokio::fs::read(dir.path().join("doc.txt")).await.unwrap();
        assert_eq!(current, b"v4");
        let bak1 = tokio::fs::read(dir.path().join("doc.txt.v1.bak")).await.unwrap();
        assert_eq!(bak1, b"v3");
        let bak2 = tokio::fs::read(dir.path().join("doc.txt.v2.bak")).await.unwrap();
        assert_eq!(bak2, b"v2");
        let bak3 = tokio::fs::read(dir.path().join("doc.txt.v3.bak")).await.unwrap();
        assert_eq!(bak3, b"v1");
    }

    #[tokio::test]
    async fn delete_then_restore_round_trips() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.write_file("keep/me.txt", std::io::Cursor::new(b"hi".to_vec())).await.unwrap();

        let id = storage.delete("keep/me.txt").await.unwrap();
        assert!(!dir.path().join("keep/me.txt").exists());

        let trash_listing = storage.list_trash().await.unwrap();
        assert_eq!(trash_listing.len(), 1);
        assert_eq!(trash_listing[0].id, id);

        storage.restore_from_trash(&id).await.unwrap();
        let restored = tokio::fs::read(dir.path().join("keep/me.txt")).await.unwrap();
        assert_eq!(restored, b"hi");
    }

    #[tokio::test]
    async fn trash_is_hidden_from_listings() {
        let dir = tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.write_file("a.txt", std::io::Cursor::new(b"a".to_vec())).await.unwrap();
        storage.delete("a.txt").await.unwrap();

        let listing = storage.list(".").await.unwrap();
        assert!(listing.is_empty());
    }
}
