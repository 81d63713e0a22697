//! The data self-heal engine.
//!
//! One [`DataHeal`] heals one inode. The driver walks the phases in a
//! fixed order; each phase dispatches its per-replica requests as one
//! fan-out and joins on the complete response set before the next phase
//! runs. Within the copy phase reads are serial and the per-chunk sink
//! writes are the fan-out, so chunk N+1 starts only after every write of
//! chunk N has been answered.
//!
//! Teardown is the reverse of acquisition: descriptors are flushed before
//! the inode locks fall, and both happen before the heal reports its
//! outcome. Abort paths (probe silence, split brain, stat failure, open
//! failure, source read failure, cancellation, phase timeout) run the
//! same teardown restricted to whatever was actually acquired.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use log::debug;
use log::error;
use log::warn;
use smallvec::SmallVec;

use crate::Loc;
use crate::child::Child;
use crate::child::XattrMap;
use crate::fd::HealFd;
use crate::lock::Flock;
use crate::lock::LockCmd;
use crate::lock::LockType;
use crate::matrix::PendingMatrix;
use crate::matrix::select_source;
use crate::open_flags::OpenFlags;

/// Ceiling on the copy granularity regardless of what a backend's stat
/// claims. Matches the largest write any sane backend accepts.
const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

type ChildSet = SmallVec<[usize; 8]>;

/// Tunables of one heal invocation.
#[derive(Clone, Debug)]
pub struct HealConfig {
    /// Copy granularity to fall back on when the source's stat reports a
    /// zero block size. A sane nonzero report is used as-is.
    pub fallback_block_size: u32,
    /// Upper bound on each phase fan-out (every copy chunk counts as one
    /// fan-out). Expiry aborts the heal through the regular teardown
    /// path. `None` waits indefinitely.
    pub phase_timeout: Option<Duration>,
}

impl Default for HealConfig {
    fn default() -> HealConfig {
        HealConfig {
            fallback_block_size: 128 * 1024,
            phase_timeout: None,
        }
    }
}

/// Overall outcome of one heal invocation.
///
/// Individual backend errors never surface; they fold into one of these.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HealOutcome {
    /// At least one sink now matches the source.
    Healed,
    /// Nothing to do: no pending marks, or nobody reachable to heal.
    NoOp,
    /// Every replica stands accused; no source could be elected.
    SplitBrain,
    /// The heal gave up part way; acquired locks and descriptors were
    /// released, but sink contents are unspecified.
    Aborted,
}

/// What one heal invocation did.
#[derive(Clone, Debug)]
pub struct HealReport {
    /// Folded outcome.
    pub outcome: HealOutcome,
    /// The elected source, once election happened.
    pub source: Option<usize>,
    /// Sinks that received every chunk; their pending marks may be
    /// cleared by the transaction layer.
    pub healed_sinks: Vec<usize>,
    /// Sinks dropped after a failed or short write; they stay marked
    /// stale. Sinks of an aborted heal appear in neither list.
    pub failed_sinks: Vec<usize>,
    /// Bytes the copy loop advanced past before the heal ended.
    pub bytes_copied: u64,
}

impl HealReport {
    fn plain(outcome: HealOutcome) -> HealReport {
        HealReport {
            outcome,
            source: None,
            healed_sinks: Vec::new(),
            failed_sinks: Vec::new(),
            bytes_copied: 0,
        }
    }
}

/// Cooperative cancellation of a running heal.
///
/// The flag is observed at every join edge; the engine then skips to the
/// teardown of whatever it holds. In-flight backend requests of the
/// current fan-out are still awaited first.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Ask the heal to stop at the next join edge.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Phases with a fan-out, used for timeout accounting and logging.
#[derive(Clone, Copy, Debug)]
enum Phase {
    Probe,
    Stat,
    Lock,
    Open,
    Copy,
    Flush,
    Unlock,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Probe => "probe",
            Phase::Stat => "source stat",
            Phase::Lock => "lock",
            Phase::Open => "open",
            Phase::Copy => "copy",
            Phase::Flush => "flush",
            Phase::Unlock => "unlock",
        };
        f.write_str(name)
    }
}

/// Self-heal of one replicated file.
///
/// Constructed per inode by the outer translator once it suspects
/// divergence, run to completion exactly once, then discarded.
pub struct DataHeal {
    loc: Loc,
    children: Vec<Arc<dyn Child>>,
    child_up: Vec<bool>,
    config: HealConfig,
    cancel: CancelHandle,
}

impl fmt::Debug for DataHeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHeal")
            .field("loc", &self.loc)
            .field("child_up", &self.child_up)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DataHeal {
    /// Set up a heal of the file at `loc` replicated across `children`.
    ///
    /// `child_up[i]` tells whether replica i was reachable when the heal
    /// was decided; unreachable replicas receive no requests at all.
    pub fn new(
        loc: Loc,
        children: Vec<Arc<dyn Child>>,
        child_up: Vec<bool>,
        config: HealConfig,
    ) -> DataHeal {
        assert_eq!(
            children.len(),
            child_up.len(),
            "one reachability flag per child"
        );
        DataHeal {
            loc,
            children,
            child_up,
            config,
            cancel: CancelHandle::default(),
        }
    }

    /// Handle for cancelling this heal from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drive the heal to completion and report what happened.
    ///
    /// Every lock and descriptor the heal acquired has been released by
    /// the time this returns.
    pub async fn run(self) -> HealReport {
        let report = self.drive().await;
        debug!(
            "terminating self heal of {:?}: {:?}",
            self.loc.path, report.outcome
        );
        report
    }

    /// Spawn the heal on the runtime and hand the report to `completion`.
    ///
    /// `completion` is invoked exactly once, after all per-heal resources
    /// are gone, so it may immediately requeue work against the same
    /// inode.
    pub fn start<F>(self, completion: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(HealReport) + Send + 'static,
    {
        tokio::spawn(async move {
            let report = self.run().await;
            completion(report);
        })
    }

    async fn drive(&self) -> HealReport {
        if self.cancel.is_cancelled() {
            return HealReport::plain(HealOutcome::Aborted);
        }

        // P1: probe
        let Some(xattrs) = self.probe().await else {
            return HealReport::plain(HealOutcome::Aborted);
        };
        if xattrs.iter().all(Option::is_none) {
            warn!("no replica answered the probe of {:?}", self.loc.path);
            return HealReport::plain(HealOutcome::NoOp);
        }
        if self.cancel.is_cancelled() {
            return HealReport::plain(HealOutcome::Aborted);
        }

        // P2: arbitration
        let names: Vec<&str> = self.children.iter().map(|c| c.name()).collect();
        let matrix = PendingMatrix::from_probes(&names, &xattrs);
        debug!("pending matrix of {:?}:\n{}", self.loc.path, matrix);
        if matrix.is_zero() {
            debug!("no self heal needed on {:?}", self.loc.path);
            return HealReport::plain(HealOutcome::NoOp);
        }
        let sources = matrix.candidate_sources();
        if sources.iter().all(|&s| !s) {
            error!("split brain detected on {:?}, refusing to heal", self.loc.path);
            return HealReport::plain(HealOutcome::SplitBrain);
        }
        let Some(source) = select_source(&sources, &self.child_up) else {
            warn!("every candidate source of {:?} is down", self.loc.path);
            return HealReport::plain(HealOutcome::Aborted);
        };
        let sinks: ChildSet = (0..self.children.len())
            .filter(|&i| !sources[i] && self.child_up[i])
            .collect();
        if sinks.is_empty() {
            debug!("every sink of {:?} is down, nothing to sync", self.loc.path);
            return HealReport::plain(HealOutcome::NoOp);
        }
        debug!(
            "starting self heal of {:?}: child {} is source, sinks {:?}",
            self.loc.path, source, sinks
        );

        // P3: source stat
        let stat = self
            .bounded(Phase::Stat, self.children[source].stat(&self.loc))
            .await;
        let (file_size, block_size) = match stat {
            Some(Ok(stat)) => (stat.size, sanitize_block_size(stat.blksize, &self.config)),
            Some(Err(errno)) => {
                warn!("stat of source child {source} failed: {errno}");
                return self.aborted(source, &[]);
            }
            None => return self.aborted(source, &[]),
        };
        debug!(
            "got stat from source child {source}: block size {block_size}, file size {file_size}"
        );

        // P4: lock source and sinks
        let involved = involved_set(source, &sinks);
        let lock = self
            .bounded(
                Phase::Lock,
                self.lock_inodes(&involved, LockType::F_WRLCK),
            )
            .await;
        if lock.is_none() || self.cancel.is_cancelled() {
            // A timed-out fan-out may still have landed locks.
            self.finalize(None, None, &involved).await;
            return self.aborted(source, &[]);
        }

        // P5: bind the shared heal descriptor
        let fd = HealFd::create(self.loc.ino);
        let Some(open_results) = self
            .bounded(Phase::Open, self.open_all(&involved, &fd))
            .await
        else {
            self.finalize(None, None, &involved).await;
            return self.aborted(source, &[]);
        };
        let mut opened: ChildSet = ChildSet::new();
        let mut open_failed = false;
        for (i, result) in open_results {
            match result {
                Ok(()) => opened.push(i),
                Err(errno) => {
                    warn!("open on child {i} failed: {errno}");
                    open_failed = true;
                }
            }
        }
        if open_failed || self.cancel.is_cancelled() {
            self.finalize(Some((&fd, &opened)), None, &involved).await;
            return self.aborted(source, &[]);
        }
        debug!("heal descriptor bound on {} children, commencing sync", opened.len());

        // P6: copy
        let mut live = sinks.clone();
        let mut failed: ChildSet = ChildSet::new();
        let mut offset: u64 = 0;
        while offset < file_size {
            if self.cancel.is_cancelled() {
                self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                    .await;
                let mut report = self.aborted(source, &failed);
                report.bytes_copied = offset;
                return report;
            }

            let read = self
                .bounded(
                    Phase::Copy,
                    self.children[source].readv(&fd, block_size, offset),
                )
                .await;
            let data = match read {
                Some(Ok((data, _))) if !data.is_empty() => data,
                Some(Ok(_)) => {
                    warn!(
                        "source child {source} of {:?} ran out of data at offset {offset}, \
                         expected {file_size} bytes",
                        self.loc.path
                    );
                    self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                        .await;
                    let mut report = self.aborted(source, &failed);
                    report.bytes_copied = offset;
                    return report;
                }
                Some(Err(errno)) => {
                    warn!("read from source child {source} at offset {offset} failed: {errno}");
                    self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                        .await;
                    let mut report = self.aborted(source, &failed);
                    report.bytes_copied = offset;
                    return report;
                }
                None => {
                    self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                        .await;
                    let mut report = self.aborted(source, &failed);
                    report.bytes_copied = offset;
                    return report;
                }
            };
            debug!(
                "read {} bytes from child {source} at offset {offset}",
                data.len()
            );

            let writes = live.iter().map(|&i| {
                let child = &self.children[i];
                let fd = &fd;
                let data = data.as_slice();
                async move { (i, child.writev(fd, data, offset).await) }
            });
            let Some(write_results) = self.bounded(Phase::Copy, join_all(writes)).await else {
                self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                    .await;
                let mut report = self.aborted(source, &failed);
                report.bytes_copied = offset;
                return report;
            };
            for (i, result) in write_results {
                match result {
                    Ok((n, _)) if n == data.len() as u64 => {
                        debug!("wrote {n} bytes to child {i} at offset {offset}");
                    }
                    Ok((n, _)) => {
                        warn!(
                            "short write to child {i} at offset {offset}: {n} of {} bytes, \
                             dropping it from the sync",
                            data.len()
                        );
                        failed.push(i);
                    }
                    Err(errno) => {
                        warn!(
                            "write to child {i} at offset {offset} failed: {errno}, \
                             dropping it from the sync"
                        );
                        failed.push(i);
                    }
                }
            }
            live.retain(|i| !failed.contains(i));

            offset += data.len() as u64;
            if live.is_empty() {
                break;
            }
        }

        // P7: flush, release pending marks, unlock
        if live.is_empty() {
            warn!("every sink of {:?} failed during the sync", self.loc.path);
            self.finalize(Some((&fd, &involved_set(source, &live))), None, &involved)
                .await;
            let mut report = self.aborted(source, &failed);
            report.bytes_copied = offset;
            return report;
        }
        self.finalize(
            Some((&fd, &involved_set(source, &live))),
            Some(&live),
            &involved,
        )
        .await;
        HealReport {
            outcome: HealOutcome::Healed,
            source: Some(source),
            healed_sinks: live.to_vec(),
            failed_sinks: failed.to_vec(),
            bytes_copied: offset,
        }
    }

    /// Lookup with attribute request on every reachable child. `None`
    /// means the phase timed out; a per-child failure leaves that entry
    /// absent.
    async fn probe(&self) -> Option<Vec<Option<XattrMap>>> {
        let lookups = self
            .children
            .iter()
            .enumerate()
            .filter(|&(i, _)| self.child_up[i])
            .map(|(i, child)| async move { (i, child.lookup(&self.loc, true).await) });
        let results = self.bounded(Phase::Probe, join_all(lookups)).await?;

        let mut xattrs = vec![None; self.children.len()];
        for (i, result) in results {
            match result {
                Ok((_, xattr)) => xattrs[i] = Some(xattr),
                Err(errno) => warn!("probe of child {i} failed: {errno}"),
            }
        }
        Some(xattrs)
    }

    /// Whole-file lock (or unlock) fan-out over `set`. Per-child failures
    /// are logged and tolerated.
    async fn lock_inodes(&self, set: &[usize], lock_type: LockType) {
        let flock = Flock::whole_file(lock_type);
        let requests = set.iter().map(|&i| {
            let child = &self.children[i];
            async move { (i, child.inodelk(&self.loc, LockCmd::F_SETLK, flock).await) }
        });
        for (i, result) in join_all(requests).await {
            match (lock_type, result) {
                (_, Err(errno)) => {
                    warn!("{lock_type:?} on inode of child {i} failed: {errno}")
                }
                (LockType::F_WRLCK, Ok(())) => debug!("inode on child {i} locked"),
                (LockType::F_UNLCK, Ok(())) => debug!("inode on child {i} unlocked"),
            }
        }
    }

    async fn open_all(&self, set: &[usize], fd: &HealFd) -> Vec<(usize, crate::OpResult<()>)> {
        let opens = set.iter().map(|&i| {
            let child = &self.children[i];
            async move {
                (
                    i,
                    child.open(&self.loc, OpenFlags::healing(), fd).await,
                )
            }
        });
        join_all(opens).await
    }

    async fn flush_all(&self, set: &[usize], fd: &HealFd) {
        let flushes = set.iter().map(|&i| {
            let child = &self.children[i];
            async move { (i, child.flush(fd).await) }
        });
        for (i, result) in join_all(flushes).await {
            if let Err(errno) = result {
                warn!("flush on child {i} failed: {errno}");
            }
        }
    }

    /// Tear down in reverse acquisition order: flush the descriptor on
    /// `flush` (when one was bound), release the pending marks of
    /// `erase`, then drop the locks on `locked`. Failures and timeouts
    /// are logged; teardown never stops early.
    async fn finalize(
        &self,
        fd: Option<(&HealFd, &[usize])>,
        erase: Option<&[usize]>,
        locked: &[usize],
    ) {
        if let Some((fd, flush)) = fd {
            if !flush.is_empty() {
                self.bounded(Phase::Flush, self.flush_all(flush, fd)).await;
            }
        }
        if let Some(healed) = erase {
            self.erase_pending(healed);
        }
        if !locked.is_empty() {
            self.bounded(Phase::Unlock, self.lock_inodes(locked, LockType::F_UNLCK))
                .await;
        }
    }

    /// Report which sinks finished the sync. The counter rollback itself
    /// is a transaction owned by the write path; the engine only
    /// establishes eligibility.
    fn erase_pending(&self, healed: &[usize]) {
        debug!(
            "sinks {healed:?} of {:?} are in sync, pending marks eligible for clearing",
            self.loc.path
        );
    }

    fn aborted(&self, source: usize, failed: &[usize]) -> HealReport {
        HealReport {
            outcome: HealOutcome::Aborted,
            source: Some(source),
            healed_sinks: Vec::new(),
            failed_sinks: failed.to_vec(),
            bytes_copied: 0,
        }
    }

    /// Run `fut` under the configured phase timeout. `None` means the
    /// phase expired; whatever requests were still in flight are dropped.
    async fn bounded<T>(&self, phase: Phase, fut: impl Future<Output = T>) -> Option<T> {
        match self.config.phase_timeout {
            None => Some(fut.await),
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(
                        "{phase} phase of {:?} timed out after {limit:?}",
                        self.loc.path
                    );
                    None
                }
            },
        }
    }
}

fn involved_set(source: usize, sinks: &[usize]) -> SmallVec<[usize; 8]> {
    let mut set = SmallVec::new();
    set.push(source);
    set.extend_from_slice(sinks);
    set
}

fn sanitize_block_size(reported: u32, config: &HealConfig) -> u32 {
    if reported == 0 {
        config.fallback_block_size
    } else {
        reported.min(MAX_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_size_is_sanitized() {
        let config = HealConfig::default();
        // A zero report takes the fallback; a sane report passes through.
        assert_eq!(sanitize_block_size(0, &config), 128 * 1024);
        assert_eq!(sanitize_block_size(4096, &config), 4096);
        assert_eq!(
            sanitize_block_size(u32::MAX, &config),
            MAX_BLOCK_SIZE
        );
    }

    #[test]
    fn involved_set_puts_source_first() {
        assert_eq!(involved_set(1, &[0, 2]).as_slice(), [1, 0, 2]);
        assert_eq!(involved_set(0, &[]).as_slice(), [0]);
    }
}
