//! Process-wide buffer pools keyed by shape (plaintext / ciphertext / nonce
//! chunk buffers), so the container codec's hot loop does not allocate per
//! chunk. Pools are advisory: if a pool is empty, callers fall back to a
//! fresh allocation, so correctness never depends on pooling (spec §4.1,
//! §9 — explicit init/teardown, no hidden lazy global).
//!
//! The teacher crate allocates a fresh `Vec<u8>` per file transfer, which is
//! fine for a one-shot CLI but not for a server handling many concurrent
//! streams; `crossbeam_queue::ArrayQueue` gives a lock-free pool without
//! reaching for a process-global `static` (none of the pack examples pool
//! buffers, so this is the idiomatic off-the-shelf primitive for the job).

use super::{CHUNK_SIZE, CIPHERTEXT_CHUNK_SIZE, NONCE_SIZE};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

const POOL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct BufferPools {
    plaintext: Arc<ArrayQueue<Vec<u8>>>,
    ciphertext: Arc<ArrayQueue<Vec<u8>>>,
    nonce: Arc<ArrayQueue<Vec<u8>>>,
}

impl BufferPools {
    pub fn new() -> Self {
        Self {
            plaintext: Arc::new(ArrayQueue::new(POOL_CAPACITY)),
            ciphertext: Arc::new(ArrayQueue::new(POOL_CAPACITY)),
            nonce: Arc::new(ArrayQueue::new(POOL_CAPACITY)),
        }
    }

    pub fn take_plaintext(&self) -> PooledBuffer {
        self.take(&self.plaintext, CHUNK_SIZE)
    }

    pub fn take_ciphertext(&self) -> PooledBuffer {
        self.take(&self.ciphertext, CIPHERTEXT_CHUNK_SIZE)
    }

    pub fn take_nonce(&self) -> PooledBuffer {
        self.take(&self.nonce, NONCE_SIZE)
    }

    fn take(&self, queue: &Arc<ArrayQueue<Vec<u8>>>, size: usize) -> PooledBuffer {
        let mut buf = queue.pop().unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        PooledBuffer {
            buf: Some(buf),
            home: queue.clone(),
        }
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer borrowed from a pool. Uniquely owned by the holder; returned to
/// its home queue on drop (best-effort — a full queue just drops it).
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    home: Arc<ArrayQueue<Vec<u8>>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            crate::crypto::wipe(&mut buf);
            let _ = self.home.push(buf);
        }
    }
}
