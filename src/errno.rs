//! Raw OS error numbers as reported by backend replicas.

use std::fmt;
use std::io;

/// A raw `errno` value carried back from a backend replica.
///
/// Children may be remote processes, so errors cross the operation
/// boundary as plain numbers rather than `io::Error` values.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Errno(pub libc::c_int);

impl Errno {
    /// I/O error.
    pub const EIO: Errno = Errno(libc::EIO);
    /// No such file or directory.
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    /// Bad file descriptor.
    pub const EBADF: Errno = Errno(libc::EBADF);
    /// Invalid argument.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    /// Replica is not connected.
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);
    /// Operation timed out.
    pub const ETIMEDOUT: Errno = Errno(libc::ETIMEDOUT);
    /// Operation canceled.
    pub const ECANCELED: Errno = Errno(libc::ECANCELED);

    /// The raw error number.
    pub fn raw(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&io::Error::from_raw_os_error(self.0), f)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.0)
    }
}
