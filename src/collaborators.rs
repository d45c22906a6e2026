//! Seam traits for the optional collaborators named in the spec (C8):
//! honeyfile tripwires, an AI-feeder notification sink, and the auth
//! context a request carries. None of these have a mandated
//! implementation; the server wires in no-op defaults unless a deployment
//! provides real ones. Grounded on the teacher's `BlobStore` pattern of
//! keeping side-effecting collaborators behind a trait so the hot path
//! never blocks on them.

use async_trait::async_trait;

/// Checked before any decrypted byte of a flagged path is served.
/// Tripping a honeyfile must read as a 403, not a 404 — the caller should
/// not learn the file doesn't exist, only that it's forbidden.
#[async_trait]
pub trait HoneyfileGuard: Send + Sync {
    async fn is_honeyfile(&self, relative_path: &str) -> bool {
        let _ = relative_path;
        false
    }

    async fn record_trip(&self, relative_path: &str, auth: &AuthContext) {
        let _ = (relative_path, auth);
    }
}

/// Default no-op guard; nothing is ever a honeyfile.
pub struct NoHoneyfiles;

#[async_trait]
impl HoneyfileGuard for NoHoneyfiles {}

/// Fire-and-forget notification of a completed upload, for an external
/// indexer/classifier. Must never block the response path: implementors
/// are expected to hand the notification to `tokio::spawn` internally.
#[async_trait]
pub trait AiFeeder: Send + Sync {
    async fn notify_upload(&self, relative_path: &str, size: u64) {
        let _ = (relative_path, size);
    }
}

pub struct NoopFeeder;

#[async_trait]
impl AiFeeder for NoopFeeder {}

/// Retries a fallible notification a bounded number of times before
/// giving up silently — used by real `AiFeeder` implementations so a
/// flaky downstream doesn't turn into an unbounded background task.
pub async fn notify_with_retry<F, Fut>(mut attempt: F, max_attempts: u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(()) => return,
            Err(_) if tries >= max_attempts => return,
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(100 * tries as u64)).await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self { user_id: "anonymous".to_string(), is_admin: false }
    }
}
