//! Replica data self-heal engine
//!
//! When a file is replicated across N backend children, client writes that
//! reach only a subset of the replicas leave the copies diverged. Each
//! replica keeps a pending-write counter against every other replica; the
//! engine probes those counters, arbitrates which replicas are
//! authoritative, and overwrites the stale ones from an elected source
//! while a whole-file inode lock keeps concurrent client I/O out.
//!
//! The heal of one inode is a strict sequence of phases. Every phase fans
//! out asynchronous requests to some subset of the children and joins on
//! the complete set of responses before the next phase begins:
//!
//! 1. probe all reachable children for their pending-write attributes
//! 2. build the pending matrix, classify sources and sinks, elect a source
//! 3. stat the source for file length and I/O block size
//! 4. take a whole-file write lock on the source and every sink
//! 5. bind a shared heal descriptor on the source and every sink
//! 6. stream the source's contents chunk by chunk onto the sinks
//! 7. flush, release pending marks, unlock and report the outcome
//!
//! Backends are abstracted behind the [`Child`] trait; the engine only
//! issues operations and consumes their outcomes. [`MemChild`] is an
//! in-memory reference backend used by the test-suite.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::path::Path;
use std::path::PathBuf;

pub use crate::child::Child;
pub use crate::child::OpResult;
pub use crate::child::XattrMap;
pub use crate::errno::Errno;
pub use crate::fd::HealFd;
pub use crate::heal::CancelHandle;
pub use crate::heal::DataHeal;
pub use crate::heal::HealConfig;
pub use crate::heal::HealOutcome;
pub use crate::heal::HealReport;
pub use crate::lock::Flock;
pub use crate::lock::LockCmd;
pub use crate::lock::LockType;
pub use crate::matrix::PendingMatrix;
pub use crate::mem::MemChild;
pub use crate::mem::OpRecord;
pub use crate::open_flags::OpenFlags;
pub use crate::pending::PendingRecord;
pub use crate::pending::pending_key;

mod child;
mod errno;
mod fd;
mod heal;
mod lock;
mod matrix;
mod mem;
mod open_flags;
mod pending;

/// Canonical location of the inode being healed.
///
/// Children resolve operations against the path; the inode number ties the
/// heal descriptor and lock requests to the same object on every replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Loc {
    /// Path of the file below the replicated volume root.
    pub path: PathBuf,
    /// Inode number of the file.
    pub ino: u64,
}

impl Loc {
    /// Create a location from a volume-relative path and inode number.
    pub fn new<P: AsRef<Path>>(path: P, ino: u64) -> Loc {
        Loc {
            path: path.as_ref().to_owned(),
            ino,
        }
    }
}

/// The slice of `stat` data the engine consumes from a replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    /// Inode number on the replying replica.
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Preferred I/O granularity reported by the backend.
    pub blksize: u32,
}
