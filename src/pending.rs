//! Pending-versions attribute codec.
//!
//! Every replica stores, for each of its siblings, a fixed-width record of
//! counters under `trusted.replheal.<sibling-name>`. A nonzero counter
//! means "this replica knows of writes the sibling has not acknowledged".
//! The counters are kept in network byte order by the legacy transaction
//! layer, and replicas written by it must keep parsing, so the layout here
//! is bit-exact: three big-endian `u32`s, of which the data heal only
//! consumes the first.

use log::warn;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::U32;

use crate::child::XattrMap;

/// Attribute namespace the pending records live under.
pub(crate) const PENDING_KEY_PREFIX: &str = "trusted.replheal.";

/// The attribute key replica `child` records its pending counters under
/// on its siblings.
pub fn pending_key(child: &str) -> String {
    format!("{PENDING_KEY_PREFIX}{child}")
}

/// On-disk pending-counters record, one per sibling replica.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PendingRecord {
    /// Unacknowledged data writes.
    pub data: U32<BigEndian>,
    /// Unacknowledged metadata changes.
    pub metadata: U32<BigEndian>,
    /// Unacknowledged directory-entry changes.
    pub entry: U32<BigEndian>,
}

impl PendingRecord {
    /// Build a record from host-order counters.
    pub fn new(data: u32, metadata: u32, entry: u32) -> PendingRecord {
        PendingRecord {
            data: U32::new(data),
            metadata: U32::new(metadata),
            entry: U32::new(entry),
        }
    }

    /// Serialized form as stored in the extended attribute.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

/// The data-pending counter replica `holder`'s attributes record against
/// replica `against`.
///
/// A missing entry counts as zero. A malformed entry also counts as zero:
/// an accusation that cannot be decoded must not disqualify a replica
/// from being a source.
pub(crate) fn data_pending(xattr: &XattrMap, holder: &str, against: &str) -> u32 {
    let key = pending_key(against);
    let Some(raw) = xattr.get(&key) else {
        return 0;
    };
    match PendingRecord::read_from_bytes(raw.as_slice()) {
        Ok(record) => record.data.get(),
        Err(_) => {
            warn!(
                "replica {holder}: pending record {key} has {} bytes, expected {}",
                raw.len(),
                size_of::<PendingRecord>()
            );
            0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_is_network_byte_order() {
        let record = PendingRecord::new(0x0102_0304, 5, 6);
        assert_eq!(
            record.to_bytes(),
            [1, 2, 3, 4, 0, 0, 0, 5, 0, 0, 0, 6],
        );
    }

    #[test]
    fn roundtrip() {
        let record = PendingRecord::new(3, 0, 1);
        let parsed = PendingRecord::read_from_bytes(record.to_bytes().as_slice()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn missing_and_malformed_entries_count_as_zero() {
        let mut xattr = XattrMap::new();
        assert_eq!(data_pending(&xattr, "r0", "r1"), 0);

        xattr.insert(pending_key("r1"), vec![0xff; 3]);
        assert_eq!(data_pending(&xattr, "r0", "r1"), 0);

        xattr.insert(pending_key("r1"), PendingRecord::new(2, 9, 9).to_bytes());
        assert_eq!(data_pending(&xattr, "r0", "r1"), 2);
    }
}
