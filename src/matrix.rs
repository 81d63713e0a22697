//! Pending-matrix arbitration.
//!
//! Cell `[i][j]` of the matrix is the data-pending counter replica i holds
//! against replica j: "i knows of writes j has not acknowledged". A
//! replica nobody accuses is a candidate source; everything else is a sink
//! that must be overwritten. If every replica stands accused the file is
//! in split brain and no heal is possible.

use std::fmt;

use smallvec::SmallVec;

use crate::child::XattrMap;
use crate::pending::data_pending;

/// Per-replica boolean vector; true marks a candidate source.
pub(crate) type SourceVec = SmallVec<[bool; 8]>;

/// The N x N matrix of data-pending counters sampled during the probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingMatrix {
    n: usize,
    cells: Vec<u32>,
}

impl PendingMatrix {
    /// Build the matrix from the probed attribute maps.
    ///
    /// `names[i]` is the stable identifier of replica i, the key its
    /// siblings record counters under. Replicas whose probe failed
    /// (`xattrs[i]` absent) contribute an all-zero row: a replica that
    /// cannot be asked accuses nobody.
    pub fn from_probes(names: &[&str], xattrs: &[Option<XattrMap>]) -> PendingMatrix {
        let n = names.len();
        let mut matrix = PendingMatrix {
            n,
            cells: vec![0; n * n],
        };
        for (i, probed) in xattrs.iter().enumerate() {
            let Some(xattr) = probed else { continue };
            for j in 0..n {
                matrix.cells[i * n + j] = data_pending(xattr, names[i], names[j]);
            }
        }
        matrix
    }

    /// Counter replica `i` holds against replica `j`.
    pub fn get(&self, i: usize, j: usize) -> u32 {
        self.cells[i * self.n + j]
    }

    /// True when no replica accuses any other; nothing to heal.
    pub fn is_zero(&self) -> bool {
        self.cells.iter().all(|&c| c == 0)
    }

    /// Classify replicas: `true` for every candidate source, i.e. every
    /// replica j with a zero column (`forall i: [i][j] == 0`).
    pub fn candidate_sources(&self) -> SourceVec {
        (0..self.n)
            .map(|j| (0..self.n).all(|i| self.get(i, j) == 0))
            .collect()
    }
}

impl fmt::Display for PendingMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.n {
            write!(f, "[")?;
            for j in 0..self.n {
                write!(f, " {}", self.get(i, j))?;
            }
            writeln!(f, " ]")?;
        }
        Ok(())
    }
}

/// Elect the source among the candidates.
///
/// Lowest reachable candidate index wins, so repeated heals of the same
/// file converge on the same source. Returns `None` when every candidate
/// is down.
pub(crate) fn select_source(sources: &[bool], child_up: &[bool]) -> Option<usize> {
    sources
        .iter()
        .zip(child_up)
        .position(|(&candidate, &up)| candidate && up)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pending::{PendingRecord, pending_key};

    const NAMES: [&str; 3] = ["r0", "r1", "r2"];

    fn accuse(targets: &[(&str, u32)]) -> Option<XattrMap> {
        let mut xattr = XattrMap::new();
        for &(name, count) in targets {
            xattr.insert(pending_key(name), PendingRecord::new(count, 0, 0).to_bytes());
        }
        Some(xattr)
    }

    #[test]
    fn all_quiet_matrix_is_zero() {
        let xattrs = vec![accuse(&[]), accuse(&[]), accuse(&[])];
        let matrix = PendingMatrix::from_probes(&NAMES, &xattrs);
        assert!(matrix.is_zero());
        assert_eq!(matrix.candidate_sources().as_slice(), [true, true, true]);
    }

    #[test]
    fn accused_replica_becomes_sink() {
        let xattrs = vec![accuse(&[("r2", 1)]), accuse(&[]), accuse(&[])];
        let matrix = PendingMatrix::from_probes(&NAMES, &xattrs);
        assert_eq!(matrix.get(0, 2), 1);
        assert!(!matrix.is_zero());
        assert_eq!(matrix.candidate_sources().as_slice(), [true, true, false]);
    }

    #[test]
    fn absent_probe_contributes_zero_row() {
        let xattrs = vec![accuse(&[("r1", 4)]), None, accuse(&[])];
        let matrix = PendingMatrix::from_probes(&NAMES, &xattrs);
        assert_eq!(matrix.get(1, 0), 0);
        assert_eq!(matrix.get(1, 2), 0);
        assert_eq!(matrix.candidate_sources().as_slice(), [true, false, true]);
    }

    #[test]
    fn mutual_accusation_is_split_brain() {
        let names = ["r0", "r1"];
        let xattrs = vec![accuse(&[("r1", 1)]), accuse(&[("r0", 2)])];
        let matrix = PendingMatrix::from_probes(&names, &xattrs);
        let sources = matrix.candidate_sources();
        assert_eq!(sources.as_slice(), [false, false]);
        assert_eq!(select_source(&sources, &[true, true]), None);
    }

    #[test]
    fn election_is_lowest_reachable_candidate() {
        let sources = [true, true, false];
        assert_eq!(select_source(&sources, &[true, true, true]), Some(0));
        assert_eq!(select_source(&sources, &[false, true, true]), Some(1));
        assert_eq!(select_source(&sources, &[false, false, true]), None);
    }

    #[test]
    fn self_accusation_disqualifies() {
        let xattrs = vec![accuse(&[("r0", 3)]), accuse(&[]), accuse(&[])];
        let matrix = PendingMatrix::from_probes(&NAMES, &xattrs);
        assert_eq!(matrix.candidate_sources().as_slice(), [false, true, true]);
    }
}
