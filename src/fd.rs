//! The shared heal descriptor.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

static NEXT_FD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct FdInner {
    id: u64,
    ino: u64,
}

/// A file handle shared by the source and every sink for the duration of
/// one heal.
///
/// The engine creates the handle once, then asks each involved replica to
/// open it; every replica associates its own backing state with the
/// handle's id. Clones share ownership, and the backing state is released
/// when the finalizer drops the last clone after the final flush.
#[derive(Clone, Debug)]
pub struct HealFd {
    inner: Arc<FdInner>,
}

impl HealFd {
    /// Create a fresh handle for the given inode.
    pub fn create(ino: u64) -> HealFd {
        HealFd {
            inner: Arc::new(FdInner {
                id: NEXT_FD_ID.fetch_add(1, Ordering::Relaxed),
                ino,
            }),
        }
    }

    /// Process-unique id backends key their open state by.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Inode the handle was created for.
    pub fn ino(&self) -> u64 {
        self.inner.ino
    }
}
