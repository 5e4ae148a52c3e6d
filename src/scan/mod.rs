//! Sequential scan over a B-tree.
//!
//! A scan walks the level-1 internal pages in key order and reads every
//! in-memory leaf as it is met, rewound through the undo log when the leaf
//! is newer than the snapshot. Leaves found on disk are only remembered; once
//! the walk is done they are read in extent order. Ranges whose page linkage
//! changed under the walk are read by point search instead.

mod batcher;
mod callbacks;
mod cursor;
mod historical;
mod iterator;
mod parallel;
mod registry;
mod walker;

pub use batcher::DiskDownlinkEntry;
pub use callbacks::{BlockSampler, NextKey, ScanCallbacks};
pub use parallel::ParallelScanShared;
pub use registry::{global_scan_registry, ScanRegistry};
pub use walker::KeyRange;

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};

use crate::buffer::{
    BlockNumber, ChangeCount, Downlink, Key, XactInfo, INVALID_BLKNO, INVALID_CHANGE_COUNT,
};
use crate::config::SeqScanConfig;
use crate::error::SeqScanResult;
use crate::storage::{ReadPage, TreeAccess};
use crate::transaction::{Csn, Snapshot};

use batcher::DiskBatch;
use callbacks::Sampling;
use cursor::MergeCursor;
use iterator::FallbackIterator;
use walker::{WalkState, WalkStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// Walking internal pages and reading in-memory leaves.
    InMemory,
    /// Reading the batched on-disk leaves.
    Disk,
    Finished,
}

/// Where a returned tuple was read from. Invalid for leaves read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHint {
    pub blkno: BlockNumber,
    pub change_count: ChangeCount,
}

impl LeafHint {
    pub fn new(blkno: BlockNumber, change_count: ChangeCount) -> Self {
        Self {
            blkno,
            change_count,
        }
    }

    pub fn invalid() -> Self {
        Self::new(INVALID_BLKNO, INVALID_CHANGE_COUNT)
    }

    pub fn is_valid(&self) -> bool {
        self.blkno != INVALID_BLKNO
    }
}

/// Tuple version visible to the scan's snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTuple {
    pub key: Key,
    pub value: Bytes,
    /// Commit of the returned version; `None` for an uncommitted one.
    pub csn: Option<Csn>,
    pub hint: LeafHint,
}

/// Physically stored tuple, returned without any visibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTuple {
    pub key: Key,
    pub value: Bytes,
    pub xact: XactInfo,
    pub deleted: bool,
    pub hint: LeafHint,
}

enum Walk {
    Solo(WalkState),
    Parallel {
        shared: Arc<ParallelScanShared>,
        worker: usize,
    },
}

struct Registration {
    registry: Arc<ScanRegistry>,
    id: u64,
}

enum Pulled {
    Visible(ScanTuple),
    Raw(RawTuple),
}

/// Options of [`SeqScan`] beyond the tree and the snapshot.
pub struct SeqScanBuilder {
    tree: Arc<dyn TreeAccess>,
    snapshot: Snapshot,
    config: SeqScanConfig,
    callbacks: Option<Box<dyn ScanCallbacks>>,
    sampler: Option<Box<dyn BlockSampler>>,
    parallel: Option<Arc<ParallelScanShared>>,
    registry: Option<Arc<ScanRegistry>>,
}

impl SeqScanBuilder {
    pub fn config(mut self, config: SeqScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn callbacks(mut self, callbacks: Box<dyn ScanCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn sampler(mut self, sampler: Box<dyn BlockSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn parallel(mut self, shared: Arc<ParallelScanShared>) -> Self {
        self.parallel = Some(shared);
        self
    }

    pub fn registry(mut self, registry: Arc<ScanRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn open(self) -> SeqScan {
        let registry = self.registry.unwrap_or_else(global_scan_registry);
        let (id, token) = registry.register(self.tree.clone());
        let walk = match self.parallel {
            Some(shared) => {
                let worker = shared.claim_worker();
                Walk::Parallel { shared, worker }
            }
            None => Walk::Solo(WalkState::default()),
        };
        debug!(
            "scan {} opened at {:?}, retention generation {}",
            id,
            self.snapshot.csn(),
            token.generation()
        );
        SeqScan {
            tree: self.tree,
            snapshot: self.snapshot,
            phase: ScanPhase::InMemory,
            walk,
            page: None,
            iter: None,
            disk: DiskBatch::new(
                self.config.initial_disk_downlinks,
                self.config.max_disk_downlinks,
            ),
            callbacks: self.callbacks,
            sampling: self.sampler.map(Sampling::new),
            single_leaf: false,
            registration: Some(Registration { registry, id }),
        }
    }
}

/// Sequential scan handle.
///
/// Results come in key order during the in-memory phase and in extent order
/// during the disk phase; across the whole scan every visible tuple is
/// returned exactly once. Dropping the scan closes it.
pub struct SeqScan {
    tree: Arc<dyn TreeAccess>,
    snapshot: Snapshot,
    phase: ScanPhase,
    walk: Walk,
    page: Option<MergeCursor>,
    iter: Option<FallbackIterator>,
    disk: DiskBatch,
    callbacks: Option<Box<dyn ScanCallbacks>>,
    sampling: Option<Sampling>,
    single_leaf: bool,
    registration: Option<Registration>,
}

impl SeqScan {
    pub fn builder(tree: Arc<dyn TreeAccess>, snapshot: Snapshot) -> SeqScanBuilder {
        SeqScanBuilder {
            tree,
            snapshot,
            config: SeqScanConfig::default(),
            callbacks: None,
            sampler: None,
            parallel: None,
            registry: None,
        }
    }

    pub fn open(tree: Arc<dyn TreeAccess>, snapshot: Snapshot) -> SeqScan {
        Self::builder(tree, snapshot).open()
    }

    pub fn open_with_callbacks(
        tree: Arc<dyn TreeAccess>,
        snapshot: Snapshot,
        callbacks: Box<dyn ScanCallbacks>,
    ) -> SeqScan {
        Self::builder(tree, snapshot).callbacks(callbacks).open()
    }

    /// Sampling scan. It reads the newest version of every tuple and only the
    /// downlinks whose ordinal the sampler picks.
    pub fn open_sampling(tree: Arc<dyn TreeAccess>, sampler: Box<dyn BlockSampler>) -> SeqScan {
        Self::builder(tree, Snapshot::in_progress())
            .sampler(sampler)
            .open()
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Worker number within a parallel scan; solo scans are worker 0.
    pub fn worker(&self) -> usize {
        match &self.walk {
            Walk::Solo(_) => 0,
            Walk::Parallel { worker, .. } => *worker,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.worker() == 0
    }

    /// Number of on-disk leaves batched so far.
    pub fn disk_downlinks(&self) -> usize {
        self.disk.len()
    }

    /// Next tuple visible to the snapshot, or `None` at the end of the scan.
    /// An error ends the scan and releases its retention.
    pub fn next(&mut self) -> SeqScanResult<Option<ScanTuple>> {
        match self.pull(false) {
            Ok(Some(Pulled::Visible(tuple))) => Ok(Some(tuple)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!("scan failed: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Next physically stored tuple, tombstones and invisible versions
    /// included. Historical images are never consulted.
    pub fn next_raw(&mut self) -> SeqScanResult<Option<RawTuple>> {
        match self.pull(true) {
            Ok(Some(Pulled::Raw(tuple))) => Ok(Some(tuple)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!("raw scan failed: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Ends the scan and releases its retention. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.phase = ScanPhase::Finished;
        self.page = None;
        self.iter = None;
        if let Some(registration) = self.registration.take() {
            registration.registry.unregister(registration.id);
        }
    }

    fn pull(&mut self, raw: bool) -> SeqScanResult<Option<Pulled>> {
        loop {
            if let Some(iter) = self.iter.as_mut() {
                let pulled = if raw {
                    iter.next_raw(&*self.tree)?.map(Pulled::Raw)
                } else {
                    iter.next_visible(&*self.tree, &self.snapshot, &mut self.callbacks)?
                        .map(Pulled::Visible)
                };
                if pulled.is_some() {
                    return Ok(pulled);
                }
                self.iter = None;
            }

            if let Some(page) = self.page.as_mut() {
                let pulled = if raw {
                    page.next_raw().map(Pulled::Raw)
                } else {
                    page.next_visible(&*self.tree, &self.snapshot, &mut self.callbacks)?
                        .map(Pulled::Visible)
                };
                if pulled.is_some() {
                    return Ok(pulled);
                }
                self.page = None;
            }

            if !self.advance()? {
                return Ok(None);
            }
        }
    }

    /// Loads the next leaf or iterator. False once the scan is finished.
    fn advance(&mut self) -> SeqScanResult<bool> {
        loop {
            match self.phase {
                ScanPhase::InMemory => match self.walk_step()? {
                    WalkStep::Downlink {
                        downlink,
                        range,
                        read_csn,
                    } => {
                        if self.route(downlink, range, read_csn)? {
                            return Ok(true);
                        }
                    }
                    WalkStep::Iterate(range) => {
                        self.iter = Some(FallbackIterator::new(range));
                        return Ok(true);
                    }
                    WalkStep::SingleLeaf(found) => {
                        self.single_leaf = true;
                        let hint = LeafHint::new(found.blkno, found.change_count);
                        self.page = Some(MergeCursor::new(found.image, hint));
                        return Ok(true);
                    }
                    WalkStep::Exhausted => self.switch_to_disk(),
                },
                ScanPhase::Disk => {
                    if self.load_next_disk_page()? {
                        return Ok(true);
                    }
                    debug!("disk phase done, scan finished");
                    self.phase = ScanPhase::Finished;
                }
                ScanPhase::Finished => return Ok(false),
            }
        }
    }

    fn walk_step(&mut self) -> SeqScanResult<WalkStep> {
        match &mut self.walk {
            Walk::Solo(walk) => walk.next_step(&*self.tree, false),
            Walk::Parallel { shared, .. } => shared.next_step(&*self.tree),
        }
    }

    /// Sends one downlink to the matching reader. False when nothing was
    /// opened for it: the range was filtered out or the leaf went to the disk
    /// batch.
    ///
    /// An in-memory leaf is read only within the downlink's range. A boundary
    /// moved after the internal page was read leaves keys in the leaf that
    /// belong to its left neighbour's range.
    fn route(
        &mut self,
        downlink: Downlink,
        range: KeyRange,
        read_csn: Csn,
    ) -> SeqScanResult<bool> {
        if !self.wants(&range) {
            trace!("skipping range [{:?}, {:?})", range.low, range.high);
            return Ok(false);
        }
        match downlink {
            Downlink::OnDisk(extent) => {
                self.disk.push(DiskDownlinkEntry::new(extent, read_csn))?;
                Ok(false)
            }
            Downlink::InMemory {
                blkno,
                change_count,
            } => match self.tree.try_read_page(blkno, change_count)? {
                ReadPage::Ok(image) if image.is_leaf() && image.hikey() == range.high.as_ref() => {
                    self.page = Some(MergeCursor::bounded(
                        image,
                        LeafHint::new(blkno, change_count),
                        range.low,
                        range.high,
                    ));
                    Ok(true)
                }
                ReadPage::Ok(_) => {
                    debug!("leaf {} does not match its downlink range", blkno);
                    self.iter = Some(FallbackIterator::new(range));
                    Ok(true)
                }
                ReadPage::Stale => {
                    debug!("leaf {} changed since its downlink was read", blkno);
                    self.iter = Some(FallbackIterator::new(range));
                    Ok(true)
                }
            },
            Downlink::InIo(io_num) => {
                debug!("waiting for io {}", io_num);
                self.tree.wait_for_io(io_num);
                self.iter = Some(FallbackIterator::new(range));
                Ok(true)
            }
        }
    }

    fn wants(&mut self, range: &KeyRange) -> bool {
        if let Some(callbacks) = self.callbacks.as_mut() {
            return callbacks.is_range_valid(range.low.as_ref(), range.high.as_ref());
        }
        match self.sampling.as_mut() {
            Some(sampling) => sampling.admit(),
            None => true,
        }
    }

    fn switch_to_disk(&mut self) {
        if self.single_leaf {
            debug!("single leaf scan finished");
            self.phase = ScanPhase::Finished;
            return;
        }
        self.disk.sort();
        debug!(
            "worker {} switching to disk phase with {} leaves",
            self.worker(),
            self.disk.len()
        );
        self.phase = ScanPhase::Disk;
    }

    fn load_next_disk_page(&mut self) -> SeqScanResult<bool> {
        let Some(entry) = self.disk.next() else {
            return Ok(false);
        };
        let mut image = self.tree.read_page_from_disk(entry.extent)?;
        if image.csn() > entry.csn {
            image = self.tree.read_page_as_of(image, entry.csn)?;
        }
        trace!("loaded disk leaf at extent {}", entry.extent.offset);
        self.page = Some(MergeCursor::new(image, LeafHint::invalid()));
        Ok(true)
    }
}

impl Drop for SeqScan {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemTreeConfig;
    use crate::storage::MemTree;

    fn tree(n: u64) -> Arc<MemTree> {
        let config = MemTreeConfig::default()
            .with_leaf_capacity(4usize)
            .with_internal_fanout(3usize);
        Arc::new(MemTree::bulk_load(
            config,
            (1..=n).map(|k| (Key::from_u64(k), Bytes::from(k.to_string()))),
        ))
    }

    fn keys(scan: &mut SeqScan) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(t) = scan.next().unwrap() {
            out.push(t.key.as_u64().unwrap());
        }
        out
    }

    #[test]
    fn phases_advance_monotonically() {
        let tree = tree(24);
        let registry = ScanRegistry::new();
        let mut scan = SeqScan::builder(tree.clone(), tree.snapshot())
            .registry(registry.clone())
            .open();
        assert_eq!(scan.phase(), ScanPhase::InMemory);
        assert_eq!(keys(&mut scan), (1..=24).collect::<Vec<_>>());
        assert_eq!(scan.phase(), ScanPhase::Finished);
        assert!(scan.next().unwrap().is_none());
        assert_eq!(registry.len(), 1);
        scan.close();
        scan.close();
        assert!(registry.is_empty());
    }

    #[test]
    fn single_leaf_skips_the_disk_phase() {
        let tree = tree(3);
        let mut scan = SeqScan::builder(tree.clone(), tree.snapshot())
            .registry(ScanRegistry::new())
            .open();
        let first = scan.next().unwrap().unwrap();
        assert!(first.hint.is_valid());
        assert_eq!(first.csn, Some(1));
        assert_eq!(keys(&mut scan), vec![2, 3]);
        assert_eq!(scan.phase(), ScanPhase::Finished);
    }

    #[test]
    fn disk_leaves_come_after_memory_leaves() {
        let tree = tree(24);
        tree.evict(&Key::from_u64(2)).unwrap();
        tree.evict(&Key::from_u64(10)).unwrap();
        let mut scan = SeqScan::builder(tree.clone(), tree.snapshot())
            .registry(ScanRegistry::new())
            .open();
        let mut got = Vec::new();
        let mut hints = Vec::new();
        while let Some(t) = scan.next().unwrap() {
            hints.push(t.hint.is_valid());
            got.push(t.key.as_u64().unwrap());
        }
        assert_eq!(scan.disk_downlinks(), 2);
        let mut expected: Vec<u64> = (5..=8).chain(13..=24).collect();
        expected.extend(1..=4);
        expected.extend(9..=12);
        assert_eq!(got, expected);
        assert!(hints[..16].iter().all(|v| *v));
        assert!(hints[16..].iter().all(|v| !*v));
    }

    #[test]
    fn drop_releases_retention() {
        let tree = tree(8);
        let registry = ScanRegistry::new();
        let generation = tree.checkpoints().current_generation().0;
        {
            let mut scan = SeqScan::builder(tree.clone(), tree.snapshot())
                .registry(registry.clone())
                .open();
            scan.next().unwrap();
            assert!(!tree.checkpoints().can_reclaim(generation));
        }
        assert!(tree.checkpoints().can_reclaim(generation));
        assert!(registry.is_empty());
    }
}
