//! In-memory replica backend.
//!
//! The reference implementation of [`Child`]: one file body, its pending
//! attributes, advisory lock state and an operation journal behind a
//! mutex. The test-suite drives whole heals against a set of these and
//! asserts on contents and journals; fault injection covers the degraded
//! paths. It also serves as a loopback replica for experiments.

use std::collections::HashSet;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::FileStat;
use crate::Loc;
use crate::child::Child;
use crate::child::OpResult;
use crate::child::XattrMap;
use crate::errno::Errno;
use crate::fd::HealFd;
use crate::lock::Flock;
use crate::lock::LockCmd;
use crate::lock::LockType;
use crate::open_flags::OpenFlags;
use crate::pending::PendingRecord;
use crate::pending::pending_key;

/// One operation a [`MemChild`] served, in arrival order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OpRecord {
    /// A lookup, with or without the pending-attribute request.
    Lookup {
        /// Whether the pending attributes were requested.
        want_pending: bool,
    },
    /// A stat of the file.
    Stat,
    /// An inode lock request of the given type.
    Inodelk(LockType),
    /// A heal-descriptor open.
    Open,
    /// A read through the heal descriptor.
    Readv {
        /// Requested offset.
        offset: u64,
        /// Requested size.
        size: u32,
    },
    /// A write through the heal descriptor.
    Writev {
        /// Target offset.
        offset: u64,
        /// Payload length.
        len: usize,
    },
    /// A flush of the heal descriptor.
    Flush,
}

#[derive(Debug, Default)]
struct Faults {
    lookup: bool,
    stat: bool,
    inodelk: bool,
    open: bool,
    flush: bool,
    read_at: Option<u64>,
    write_at: Option<u64>,
}

#[derive(Debug)]
struct MemState {
    data: Vec<u8>,
    blksize: u32,
    xattr: XattrMap,
    open_fds: HashSet<u64>,
    lock_depth: u32,
    journal: Vec<OpRecord>,
    read_caps: VecDeque<u32>,
    faults: Faults,
}

/// An in-memory replica.
#[derive(Debug)]
pub struct MemChild {
    name: String,
    state: Mutex<MemState>,
}

impl MemChild {
    /// A fresh, empty replica named `name`.
    pub fn new(name: &str) -> MemChild {
        MemChild {
            name: name.to_owned(),
            state: Mutex::new(MemState {
                data: Vec::new(),
                blksize: 4096,
                xattr: XattrMap::new(),
                open_fds: HashSet::new(),
                lock_depth: 0,
                journal: Vec::new(),
                read_caps: VecDeque::new(),
                faults: Faults::default(),
            }),
        }
    }

    /// Replace the file body.
    pub fn set_contents(&self, data: impl Into<Vec<u8>>) {
        self.state.lock().data = data.into();
    }

    /// Current file body.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Block size the replica reports from stat.
    pub fn set_blksize(&self, blksize: u32) {
        self.state.lock().blksize = blksize;
    }

    /// Record `data_writes` unacknowledged data writes against the
    /// sibling replica named `against`.
    pub fn set_pending(&self, against: &str, data_writes: u32) {
        self.state.lock().xattr.insert(
            pending_key(against),
            PendingRecord::new(data_writes, 0, 0).to_bytes(),
        );
    }

    /// Every operation served so far.
    pub fn journal(&self) -> Vec<OpRecord> {
        self.state.lock().journal.clone()
    }

    /// Nesting depth of the advisory write lock; 0 means unlocked.
    pub fn lock_depth(&self) -> u32 {
        self.state.lock().lock_depth
    }

    /// Fail every lookup with `ENOTCONN`.
    pub fn fail_lookup(&self) {
        self.state.lock().faults.lookup = true;
    }

    /// Fail every stat with `ENOTCONN`.
    pub fn fail_stat(&self) {
        self.state.lock().faults.stat = true;
    }

    /// Fail every inode lock request with `ENOTCONN`.
    pub fn fail_inodelk(&self) {
        self.state.lock().faults.inodelk = true;
    }

    /// Fail every open with `ENOTCONN`.
    pub fn fail_open(&self) {
        self.state.lock().faults.open = true;
    }

    /// Fail every flush with `EIO`.
    pub fn fail_flush(&self) {
        self.state.lock().faults.flush = true;
    }

    /// Fail the read whose offset equals `offset` with `EIO`.
    pub fn fail_read_at(&self, offset: u64) {
        self.state.lock().faults.read_at = Some(offset);
    }

    /// Fail the write whose offset equals `offset` with `EIO`.
    pub fn fail_write_at(&self, offset: u64) {
        self.state.lock().faults.write_at = Some(offset);
    }

    /// Cap the next reads to the given byte counts, one entry per read,
    /// to exercise short-read handling.
    pub fn cap_reads(&self, caps: &[u32]) {
        self.state.lock().read_caps.extend(caps.iter().copied());
    }

    fn stat_of(state: &MemState, ino: u64) -> FileStat {
        FileStat {
            ino,
            size: state.data.len() as u64,
            blksize: state.blksize,
        }
    }
}

#[async_trait]
impl Child for MemChild {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, loc: &Loc, want_pending: bool) -> OpResult<(FileStat, XattrMap)> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Lookup { want_pending });
        if state.faults.lookup {
            return Err(Errno::ENOTCONN);
        }
        let xattr = if want_pending {
            state.xattr.clone()
        } else {
            XattrMap::new()
        };
        Ok((Self::stat_of(&state, loc.ino), xattr))
    }

    async fn stat(&self, loc: &Loc) -> OpResult<FileStat> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Stat);
        if state.faults.stat {
            return Err(Errno::ENOTCONN);
        }
        Ok(Self::stat_of(&state, loc.ino))
    }

    async fn inodelk(&self, _loc: &Loc, _cmd: LockCmd, flock: Flock) -> OpResult<()> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Inodelk(flock.lock_type));
        if state.faults.inodelk {
            return Err(Errno::ENOTCONN);
        }
        match flock.lock_type {
            LockType::F_WRLCK => state.lock_depth += 1,
            // Unlocking an unheld lock succeeds, as with POSIX locks.
            LockType::F_UNLCK => state.lock_depth = state.lock_depth.saturating_sub(1),
        }
        Ok(())
    }

    async fn open(&self, _loc: &Loc, _flags: OpenFlags, fd: &HealFd) -> OpResult<()> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Open);
        if state.faults.open {
            return Err(Errno::ENOTCONN);
        }
        state.open_fds.insert(fd.id());
        Ok(())
    }

    async fn readv(&self, fd: &HealFd, size: u32, offset: u64) -> OpResult<(Vec<u8>, FileStat)> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Readv { offset, size });
        if !state.open_fds.contains(&fd.id()) {
            return Err(Errno::EBADF);
        }
        if state.faults.read_at == Some(offset) {
            return Err(Errno::EIO);
        }
        let cap = state.read_caps.pop_front().unwrap_or(size);
        let want = size.min(cap) as usize;
        let start = (offset as usize).min(state.data.len());
        let end = (start + want).min(state.data.len());
        let chunk = state.data[start..end].to_vec();
        Ok((chunk, Self::stat_of(&state, fd.ino())))
    }

    async fn writev(&self, fd: &HealFd, data: &[u8], offset: u64) -> OpResult<(u64, FileStat)> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Writev {
            offset,
            len: data.len(),
        });
        if !state.open_fds.contains(&fd.id()) {
            return Err(Errno::EBADF);
        }
        if state.faults.write_at == Some(offset) {
            return Err(Errno::EIO);
        }
        let start = offset as usize;
        if state.data.len() < start + data.len() {
            state.data.resize(start + data.len(), 0);
        }
        state.data[start..start + data.len()].copy_from_slice(data);
        Ok((data.len() as u64, Self::stat_of(&state, fd.ino())))
    }

    async fn flush(&self, fd: &HealFd) -> OpResult<()> {
        let mut state = self.state.lock();
        state.journal.push(OpRecord::Flush);
        if !state.open_fds.contains(&fd.id()) {
            return Err(Errno::EBADF);
        }
        if state.faults.flush {
            return Err(Errno::EIO);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn loc() -> Loc {
        Loc::new("/f", 9)
    }

    #[tokio::test]
    async fn io_requires_an_open_descriptor() {
        let child = MemChild::new("r0");
        child.set_contents(*b"abcdef");
        let fd = HealFd::create(9);

        assert_eq!(child.readv(&fd, 4, 0).await, Err(Errno::EBADF));

        child
            .open(&loc(), OpenFlags::healing(), &fd)
            .await
            .unwrap();
        let (data, stat) = child.readv(&fd, 4, 2).await.unwrap();
        assert_eq!(data, b"cdef"[..4].to_vec());
        assert_eq!(stat.size, 6);
    }

    #[tokio::test]
    async fn writes_extend_the_file() {
        let child = MemChild::new("r0");
        let fd = HealFd::create(9);
        child
            .open(&loc(), OpenFlags::healing(), &fd)
            .await
            .unwrap();

        child.writev(&fd, b"xyz", 4).await.unwrap();
        assert_eq!(child.contents(), b"\0\0\0\0xyz");
    }

    #[tokio::test]
    async fn read_caps_shorten_reads_once() {
        let child = MemChild::new("r0");
        child.set_contents(vec![7u8; 100]);
        child.cap_reads(&[10]);
        let fd = HealFd::create(9);
        child
            .open(&loc(), OpenFlags::healing(), &fd)
            .await
            .unwrap();

        let (first, _) = child.readv(&fd, 64, 0).await.unwrap();
        let (second, _) = child.readv(&fd, 64, 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 64);
    }

    #[tokio::test]
    async fn lock_depth_tracks_lock_and_unlock() {
        let child = MemChild::new("r0");
        let wrlck = Flock::whole_file(LockType::F_WRLCK);
        let unlck = Flock::whole_file(LockType::F_UNLCK);

        child.inodelk(&loc(), LockCmd::F_SETLK, wrlck).await.unwrap();
        assert_eq!(child.lock_depth(), 1);
        child.inodelk(&loc(), LockCmd::F_SETLK, unlck).await.unwrap();
        child.inodelk(&loc(), LockCmd::F_SETLK, unlck).await.unwrap();
        assert_eq!(child.lock_depth(), 0);
    }
}
