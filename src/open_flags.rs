//! Open flags carried by the heal descriptor open request.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to [`Child::open`](crate::Child::open).
    ///
    /// The bit values follow the 32-bit kernel ABI rather than the host's
    /// libc: on 64-bit hosts libc reports `O_LARGEFILE` as 0, which would
    /// lose the bit for replicas running a 32-bit legacy backend.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct OpenFlags: u32 {
        /// Open for reading and writing (`O_RDWR`).
        const RDWR = libc::O_RDWR as u32;
        /// Allow offsets past 2 GiB (`O_LARGEFILE`).
        const LARGEFILE = 0o100_000;
    }
}

impl OpenFlags {
    /// The flag set the engine opens the heal descriptor with: the source
    /// is read and the sinks are written through one shared descriptor.
    pub fn healing() -> OpenFlags {
        OpenFlags::RDWR | OpenFlags::LARGEFILE
    }
}
