//! The backend replica contract.
//!
//! One [`Child`] is one of the N backends holding a copy of the replicated
//! file. The engine only ever issues the operations below and consumes
//! their outcomes; connection management, retries and the client-write
//! transaction machinery live in the surrounding translator.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::FileStat;
use crate::Loc;
use crate::errno::Errno;
use crate::fd::HealFd;
use crate::lock::Flock;
use crate::lock::LockCmd;
use crate::open_flags::OpenFlags;

/// Raw extended-attribute map returned by a lookup.
///
/// Values are the backend's stored bytes, untouched; the pending-versions
/// entries inside are decoded by [`crate::pending`]'s helpers.
pub type XattrMap = HashMap<String, Vec<u8>>;

/// Outcome of a single backend operation.
pub type OpResult<T> = Result<T, Errno>;

/// One replica backend of the replicated file.
///
/// All operations are asynchronous; the engine dispatches them in
/// per-phase fan-outs and joins on the complete response set, so
/// implementations are free to resolve them in any order. Implementations
/// must be cheap to share (`&self` receivers) because reads from the
/// source and writes to the sinks overlap in time.
#[async_trait]
pub trait Child: Send + Sync {
    /// Stable identifier of this replica.
    ///
    /// Other replicas record their pending-write counters against this
    /// name, so it must match what the write transaction layer uses when
    /// it bumps the counters.
    fn name(&self) -> &str;

    /// Resolve `loc` and, when `want_pending` is set, return the stored
    /// extended attributes alongside the stat.
    async fn lookup(&self, loc: &Loc, want_pending: bool) -> OpResult<(FileStat, XattrMap)>;

    /// Stat `loc`.
    async fn stat(&self, loc: &Loc) -> OpResult<FileStat>;

    /// Acquire or release an advisory inode range lock.
    async fn inodelk(&self, loc: &Loc, cmd: LockCmd, flock: Flock) -> OpResult<()>;

    /// Associate this replica's backing state with the shared heal
    /// descriptor `fd`.
    async fn open(&self, loc: &Loc, flags: OpenFlags, fd: &HealFd) -> OpResult<()>;

    /// Read up to `size` bytes at `offset` through `fd`.
    ///
    /// A short return is not an error; the engine treats whatever came
    /// back as the effective chunk. Zero bytes before end of file aborts
    /// the heal.
    async fn readv(&self, fd: &HealFd, size: u32, offset: u64) -> OpResult<(Vec<u8>, FileStat)>;

    /// Write `data` at `offset` through `fd`, extending the file if
    /// needed. Returns the number of bytes written.
    async fn writev(&self, fd: &HealFd, data: &[u8], offset: u64) -> OpResult<(u64, FileStat)>;

    /// Flush everything written through `fd` to stable storage.
    async fn flush(&self, fd: &HealFd) -> OpResult<()>;
}
