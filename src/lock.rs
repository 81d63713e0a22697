//! Advisory inode range locks.
//!
//! The engine serializes client writes against the copy loop with one
//! whole-file write lock per involved replica, taken before the heal
//! descriptor is opened and released after the final flush.

use std::fmt;

/// Lock type carried by an inode lock request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum LockType {
    /// Exclusive write lock.
    F_WRLCK = libc::F_WRLCK as i32,
    /// Release a previously taken lock.
    F_UNLCK = libc::F_UNLCK as i32,
}

/// Lock command carried by an inode lock request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum LockCmd {
    /// Non-blocking set: the backend answers immediately with success or
    /// `EAGAIN`-style failure.
    F_SETLK = libc::F_SETLK as i32,
}

/// Byte range a lock request covers.
///
/// `start == 0 && len == 0` means the whole file, matching the POSIX
/// `flock` convention the backends speak.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Flock {
    /// Lock or unlock.
    pub lock_type: LockType,
    /// First byte of the range.
    pub start: u64,
    /// Length of the range; 0 extends to the end of the file.
    pub len: u64,
}

impl Flock {
    /// A lock request covering the entire file.
    pub fn whole_file(lock_type: LockType) -> Flock {
        Flock {
            lock_type,
            start: 0,
            len: 0,
        }
    }
}

impl fmt::Debug for Flock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == 0 && self.len == 0 {
            write!(f, "Flock({:?}, whole file)", self.lock_type)
        } else {
            write!(
                f,
                "Flock({:?}, {}..{})",
                self.lock_type,
                self.start,
                self.start + self.len
            )
        }
    }
}
