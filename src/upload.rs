//! Chunked resumable upload coordinator (C6). Directly modeled on the
//! teacher's `BlobStore`: a `DashMap` session registry plus a background
//! reaper, generalized from "time-bounded one-shot drop" to "in-progress
//! upload session with a part file on disk and a per-session lock that
//! serializes concurrent chunk appends".

use crate::error::EceError;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, Duration};
use uuid::Uuid;

const SESSION_TTL: chrono::Duration = chrono::Duration::hours(24);

pub struct UploadSession {
    pub id: Uuid,
    pub filename: String,
    pub expected_size: u64,
    pub part_path: PathBuf,
    pub dest_relative: String,
    bytes_received: AtomicU64,
    append_lock: AsyncMutex<()>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl UploadSession {
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    sessions: Arc<DashMap<Uuid, Arc<UploadSession>>>,
    uploads_dir: PathBuf,
}

impl UploadCoordinator {
    pub fn new(uploads_dir: PathBuf) -> Self {
        Self { sessions: Arc::new(DashMap::new()), uploads_dir }
    }

    /// Start a new upload session. `dest_relative` is the final path the
    /// assembled file will be moved to on finalize; it must end in `.enc`
    /// per the spec's container-file naming contract.
    pub async fn init_upload(
        &self,
        filename: String,
        expected_size: u64,
        dest_relative: String,
    ) -> Result<Uuid, EceError> {
        if !dest_relative.ends_with(".enc") {
            return Err(EceError::BadRequest("destination must end in .enc".to_string()));
        }

        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(|e| EceError::Internal(e.to_string()))?;

        let id = Uuid::new_v4();
        let part_path = self.uploads_dir.join(format!("{}.part", id));
        tokio::fs::File::create(&part_path).await.map_err(|e| EceError::Internal(e.to_string()))?;

        let session = Arc::new(UploadSession {
            id,
            filename,
            expected_size,
            part_path,
            dest_relative,
            bytes_received: AtomicU64::new(0),
            append_lock: AsyncMutex::new(()),
            created_at: chrono::Utc::now(),
        });
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<UploadSession>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Append a chunk to the session's part file. Serialized per-session so
    /// out-of-order or concurrent chunk arrivals never interleave bytes.
    pub async fn upload_chunk(&self, id: Uuid, data: &[u8]) -> Result<u64, EceError> {
        let session = self.get(id).ok_or_else(|| EceError::NotFound(id.to_string()))?;
        let _guard = session.append_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.part_path)
            .await
            .map_err(|e| EceError::Internal(e.to_string()))?;
        file.write_all(data).await.map_err(|e| EceError::Internal(e.to_string()))?;
        file.flush().await.map_err(|e| EceError::Internal(e.to_string()))?;

        let total = session.bytes_received.fetch_add(data.len() as u64, Ordering::SeqCst) + data.len() as u64;
        Ok(total)
    }

    /// Move the assembled part file to its final destination via `storage`,
    /// then drop the session. If `reject_on_size_mismatch` is set and the
    /// received byte count disagrees with the declared size, the upload is
    /// rejected instead of silently accepted.
    pub async fn finalize_upload(
        &self,
        id: Uuid,
        storage: &crate::storage::Storage,
        reject_on_size_mismatch: bool,
    ) -> Result<String, EceError> {
        let (_, session) = self.sessions.remove(&id).ok_or_else(|| EceError::NotFound(id.to_string()))?;
        let received = session.bytes_received();

        if received != session.expected_size {
            if reject_on_size_mismatch {
                let _ = tokio::fs::remove_file(&session.part_path).await;
                return Err(EceError::BadRequest(format!(
                    "expected {} bytes, received {}",
                    session.expected_size, received
                )));
            }
            tracing::warn!(
                session = %id,
                expected = session.expected_size,
                received,
                "upload size mismatch accepted per policy"
            );
        }

        let part_file = tokio::fs::File::open(&session.part_path)
            .await
            .map_err(|e| EceError::Internal(e.to_string()))?;
        storage.write_file(&session.dest_relative, part_file).await?;
        let _ = tokio::fs::remove_file(&session.part_path).await;

        Ok(session.dest_relative.clone())
    }

    pub async fn abort_upload(&self, id: Uuid) -> Result<(), EceError> {
        if let Some((_, session)) = self.sessions.remove(&id) {
            let _ = tokio::fs::remove_file(&session.part_path).await;
        }
        Ok(())
    }

    /// Background task: evict sessions abandoned for longer than
    /// `SESSION_TTL`, removing their part files from disk.
    pub fn spawn_reaper(&self) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                let now = chrono::Utc::now();
                let stale: Vec<Uuid> = sessions
                    .iter()
                    .filter(|entry| now.signed_duration_since(entry.value().created_at) > SESSION_TTL)
                    .map(|entry| *entry.key())
                    .collect();
                for id in stale {
                    if let Some((_, session)) = sessions.remove(&id) {
                        let _ = tokio::fs::remove_file(&session.part_path).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_requires_enc_suffix() {
        let dir = tempdir().unwrap();
        let coordinator = UploadCoordinator::new(dir.path().join(".uploads"));
        let result = coordinator.init_upload("doc.txt".to_string(), 10, "doc.txt".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn chunked_upload_assembles_exact_bytes() {
        let dir = tempdir().unwrap();
        let uploads_dir = dir.path().join(".uploads");
        let coordinator = UploadCoordinator::new(uploads_dir);
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let payload = b"hello world, this is a chunked upload".to_vec();
        let id = coordinator
            .init_upload("doc.txt.enc".to_string(), payload.len() as u64, "doc.txt.enc".to_string())
            .await
            .unwrap();

        for chunk in payload.chunks(7) {
            coordinator.upload_chunk(id, chunk).await.unwrap();
        }

        let dest = coordinator.finalize_upload(id, &storage, true).await.unwrap();
        let written = tokio::fs::read(storage.get_full_path(&dest).unwrap()).await.unwrap();
        assert_eq!(written, payload);
        assert!(coordinator.get(id).is_none());
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected_when_configured() {
        let dir = tempdir().unwrap();
        let coordinator = UploadCoordinator::new(dir.path().join(".uploads"));
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let id = coordinator.init_upload("doc.txt.enc".to_string(), 100, "doc.txt.enc".to_string()).await.unwrap();
        coordinator.upload_chunk(id, b"too short").await.unwrap();

        let result = coordinator.finalize_upload(id, &storage, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn size_mismatch_is_accepted_with_warning_by_default() {
        let dir = tempdir().unwrap();
        let coordinator = UploadCoordinator::new(dir.path().join(".uploads"));
        let storage = Storage::new(dir.path().to_path_buf(), ".trash".to_string());

        let id = coordinator.init_upload("doc.txt.enc".to_string(), 100, "doc.txt.enc".to_string()).await.unwrap();
        coordinator.upload_chunk(id, b"too short").await.unwrap();

        let result = coordinator.finalize_upload(id, &storage, false).await;
        assert!(result.is_ok());
    }
}
