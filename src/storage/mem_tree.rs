use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::{
    BlockNumber, ChangeCount, DiskExtent, Downlink, InternalItem, IoNum, Key, LeafTuple,
    PageArena, PageFlags, PageImage, TupleHeader, XactInfo, INVALID_BLKNO, INVALID_CHANGE_COUNT,
};
use crate::config::MemTreeConfig;
use crate::error::{SeqScanError, SeqScanResult};
use crate::storage::{
    DiskStore, FoundPage, PageAccess, PageUndoRecord, ReadPage, TreeAccess, UndoAccess,
    UndoLocation, UndoLog, UndoPageImage,
};
use crate::transaction::{CheckpointState, Csn, Snapshot, TransactionId, CSN_FROZEN};

// bounded restarts of a point search racing with structural changes
const MAX_FIND_RESTARTS: usize = 64;

#[derive(Debug, Default)]
struct IoWaits {
    in_flight: Mutex<HashSet<IoNum>>,
    done: Condvar,
}

impl IoWaits {
    fn start(&self, io_num: IoNum) {
        self.in_flight.lock().insert(io_num);
    }

    fn finish(&self, io_num: IoNum) {
        self.in_flight.lock().remove(&io_num);
        self.done.notify_all();
    }

    fn wait(&self, io_num: IoNum, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();
        while in_flight.contains(&io_num) {
            if self.done.wait_until(&mut in_flight, deadline).timed_out() {
                warn!("wait for io {} timed out after {:?}", io_num, timeout);
                return;
            }
        }
    }
}

#[derive(Debug)]
struct PendingLoad {
    key: Key,
    extent: DiskExtent,
}

#[derive(Debug, Clone, Copy)]
struct PathStep {
    blkno: BlockNumber,
    index: usize,
}

#[derive(Debug)]
struct LeafPath {
    steps: Vec<PathStep>,
    blkno: BlockNumber,
    lokey: Option<Key>,
}

/// In-memory B-tree: leaves at level 0, level-1 internal pages linked by
/// their high keys and, when there is more than one of them, a level-2 root.
///
/// Readers never take tree-wide locks; they copy page images out of the
/// arena and validate change counts. Writers are serialized among
/// themselves and record page-level undo for every structural change and
/// tuple-level undo for every row change.
#[derive(Debug)]
pub struct MemTree {
    config: MemTreeConfig,
    arena: PageArena,
    disk: DiskStore,
    undo: UndoLog,
    checkpoints: CheckpointState,
    io: IoWaits,
    root: RwLock<BlockNumber>,
    writer: Mutex<()>,
    last_csn: AtomicU64,
    next_io: AtomicU32,
    pending_io: Mutex<HashMap<IoNum, PendingLoad>>,
}

impl MemTree {
    fn empty(config: MemTreeConfig) -> Self {
        Self {
            config,
            arena: PageArena::new(),
            disk: DiskStore::new(),
            undo: UndoLog::new(),
            checkpoints: CheckpointState::new(),
            io: IoWaits::default(),
            root: RwLock::new(INVALID_BLKNO),
            writer: Mutex::new(()),
            last_csn: AtomicU64::new(CSN_FROZEN),
            next_io: AtomicU32::new(0),
            pending_io: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a tree holding `rows`, all committed by a single first commit.
    pub fn bulk_load<I>(config: MemTreeConfig, rows: I) -> Self
    where
        I: IntoIterator<Item = (Key, Bytes)>,
    {
        let mut rows: Vec<(Key, Bytes)> = rows.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.dedup_by(|a, b| a.0 == b.0);

        let tree = Self::empty(config);
        let csn = tree.commit_csn();
        let capacity = config.leaf_capacity.max(1);
        let chunks: Vec<Vec<LeafTuple>> = if rows.is_empty() {
            vec![Vec::new()]
        } else {
            rows.chunks(capacity)
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|(k, v)| {
                            LeafTuple::new(k.clone(), TupleHeader::committed(csn), v.clone())
                        })
                        .collect()
                })
                .collect()
        };

        let lows: Vec<Key> = chunks
            .iter()
            .map(|c| c.first().map(|t| t.key.clone()).unwrap_or_default())
            .collect();
        let count = chunks.len();
        let mut children = Vec::with_capacity(count);
        for (i, tuples) in chunks.into_iter().enumerate() {
            let hikey = lows.get(i + 1).cloned();
            let flags = PageFlags {
                leftmost: i == 0,
                rightmost: i + 1 == count,
            };
            let (blkno, cc) = tree
                .arena
                .allocate(PageImage::new_leaf(flags, csn, hikey, tuples));
            children.push((lows[i].clone(), Downlink::in_memory(blkno, cc)));
        }

        let mut level = 1u8;
        while children.len() > 1 {
            let fanout = if level == 1 {
                config.internal_fanout.max(2)
            } else {
                usize::MAX
            };
            let groups: Vec<&[(Key, Downlink)]> = children.chunks(fanout).collect();
            let mut parents = Vec::with_capacity(groups.len());
            for (i, group) in groups.iter().enumerate() {
                let hikey = groups.get(i + 1).map(|next| next[0].0.clone());
                let flags = PageFlags {
                    leftmost: i == 0,
                    rightmost: i + 1 == groups.len(),
                };
                let items = group
                    .iter()
                    .enumerate()
                    .map(|(j, (key, downlink))| {
                        let key = if j == 0 { Key::default() } else { key.clone() };
                        InternalItem::new(key, *downlink)
                    })
                    .collect();
                let (blkno, cc) = tree
                    .arena
                    .allocate(PageImage::new_internal(level, flags, csn, hikey, items));
                parents.push((group[0].0.clone(), Downlink::in_memory(blkno, cc)));
            }
            children = parents;
            level += 1;
        }
        *tree.root.write() = children[0].1.blkno().unwrap_or(INVALID_BLKNO);
        debug!(
            "bulk loaded {} rows into {} leaves, root level {}",
            rows.len(),
            count,
            level - 1
        );
        tree
    }

    pub fn config(&self) -> &MemTreeConfig {
        &self.config
    }

    pub fn undo(&self) -> &UndoLog {
        &self.undo
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    /// Assigns the next commit sequence number.
    pub fn commit_csn(&self) -> Csn {
        self.last_csn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Snapshot seeing everything committed so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::as_of(self.last_csn.load(Ordering::SeqCst))
    }

    pub fn root_level(&self) -> SeqScanResult<u8> {
        let root = *self.root.read();
        Ok(self.read_image(root)?.1.level())
    }

    /// Inserts or replaces `key` as a commit at `csn`.
    pub fn put(&self, key: Key, value: Bytes, csn: Csn) -> SeqScanResult<()> {
        self.write_tuple(key, Some(value), XactInfo::Committed(csn))
            .map(|_| ())
    }

    /// Deletes `key` as a commit at `csn`, leaving a tombstone.
    pub fn delete(&self, key: Key, csn: Csn) -> SeqScanResult<bool> {
        self.write_tuple(key, None, XactInfo::Committed(csn))
    }

    pub fn put_uncommitted(
        &self,
        key: Key,
        value: Bytes,
        txn_id: TransactionId,
    ) -> SeqScanResult<()> {
        self.write_tuple(key, Some(value), XactInfo::InProgress(txn_id))
            .map(|_| ())
    }

    pub fn delete_uncommitted(&self, key: Key, txn_id: TransactionId) -> SeqScanResult<bool> {
        self.write_tuple(key, None, XactInfo::InProgress(txn_id))
    }

    fn write_tuple(&self, key: Key, value: Option<Bytes>, xact: XactInfo) -> SeqScanResult<bool> {
        let _writer = self.writer.lock();
        let path = self.leaf_path(&key)?;
        let undo = &self.undo;
        self.arena.modify(path.blkno, |page| {
            let pos = page.leaf_lower_bound(&key);
            let tuples = leaf_tuples_mut(page)?;
            let existing = tuples.get(pos).filter(|t| t.key == key).cloned();
            match (existing, value) {
                (Some(old), value) => {
                    let prev = undo.push_tuple(old.clone());
                    let deleted = value.is_none();
                    tuples[pos] = LeafTuple::new(
                        key,
                        TupleHeader {
                            xact,
                            deleted,
                            prev_version: Some(prev),
                        },
                        value.unwrap_or_default(),
                    );
                    Ok(true)
                }
                (None, Some(value)) => {
                    let header = TupleHeader {
                        xact,
                        deleted: false,
                        prev_version: None,
                    };
                    tuples.insert(pos, LeafTuple::new(key, header, value));
                    Ok(true)
                }
                (None, None) => Ok(false),
            }
        })?
    }

    /// Physically removes every tuple in `[lo, hi]` as a commit at `csn`.
    /// The former page images move to the undo log.
    pub fn delete_range(&self, lo: &Key, hi: &Key, csn: Csn) -> SeqScanResult<usize> {
        let _writer = self.writer.lock();
        let mut removed = 0;
        let mut cursor = Some(lo.clone());
        while let Some(key) = cursor {
            let path = self.leaf_path(&key)?;
            let (_, image) = self.read_image(path.blkno)?;
            cursor = image.hikey().filter(|h| *h <= hi).cloned();
            let doomed = image
                .tuples()
                .iter()
                .filter(|t| t.key >= *lo && t.key <= *hi)
                .count();
            if doomed == 0 {
                continue;
            }
            let location = self.undo.push_page(PageUndoRecord {
                images: vec![image],
                lokey: path.lokey.clone(),
            });
            self.arena.modify(path.blkno, |page| {
                if let Some(tuples) = page.tuples_mut() {
                    tuples.retain(|t| t.key < *lo || t.key > *hi);
                }
                page.header.csn = csn;
                page.header.undo = Some(location);
            })?;
            removed += doomed;
        }
        Ok(removed)
    }

    /// Splits the leaf containing `at` so that `at` becomes the first key of
    /// a new right sibling.
    pub fn split_leaf(&self, at: &Key, csn: Csn) -> SeqScanResult<()> {
        let _writer = self.writer.lock();
        let path = self.leaf_path(at)?;
        if path.lokey.as_ref().is_some_and(|lo| lo >= at) {
            return Err(SeqScanError::Internal(format!(
                "split key {:?} is the low bound of its page",
                at
            )));
        }
        let (_, old) = self.read_image(path.blkno)?;
        let pos = old.leaf_lower_bound(at);
        let left_undo = self.undo.push_page(PageUndoRecord {
            images: vec![old.clone()],
            lokey: path.lokey.clone(),
        });
        let right_undo = self.undo.push_page(PageUndoRecord {
            images: vec![old.clone()],
            lokey: Some(at.clone()),
        });

        let mut right = PageImage::new_leaf(
            PageFlags {
                leftmost: false,
                rightmost: old.is_rightmost(),
            },
            csn,
            old.header.hikey.clone(),
            old.tuples()[pos..].to_vec(),
        );
        right.header.undo = Some(right_undo);
        let (rblkno, rcc) = self.arena.allocate(right);
        self.insert_downlink(
            &path.steps,
            path.blkno,
            at,
            Downlink::in_memory(rblkno, rcc),
        )?;

        self.arena.modify(path.blkno, |page| {
            if let Some(tuples) = page.tuples_mut() {
                tuples.truncate(pos);
            }
            page.header.hikey = Some(at.clone());
            page.header.flags.rightmost = false;
            page.header.csn = csn;
            page.header.undo = Some(left_undo);
        })?;
        debug!("split leaf {} at {:?} -> {}", path.blkno, at, rblkno);
        Ok(())
    }

    /// Merges the leaf containing `key` with its right sibling under the same
    /// parent. The right page's slot is freed.
    pub fn merge_leaves(&self, key: &Key, csn: Csn) -> SeqScanResult<()> {
        let _writer = self.writer.lock();
        let path = self.leaf_path(key)?;
        let parent = *path
            .steps
            .last()
            .ok_or_else(|| SeqScanError::Internal("root leaf has no sibling".to_string()))?;
        let (_, parent_image) = self.read_image(parent.blkno)?;
        let sibling = parent_image
            .items()
            .get(parent.index + 1)
            .ok_or_else(|| {
                SeqScanError::Internal("no right sibling under the same parent".to_string())
            })?
            .downlink;
        let right_blkno = match sibling {
            Downlink::InMemory { blkno, .. } => blkno,
            Downlink::OnDisk(extent) => self.load_child(parent.blkno, parent.index + 1, extent)?,
            Downlink::InIo(io_num) => {
                return Err(SeqScanError::Internal(format!(
                    "sibling has io {} in flight",
                    io_num
                )))
            }
        };
        let (_, left) = self.read_image(path.blkno)?;
        let (_, right) = self.read_image(right_blkno)?;
        let location = self.undo.push_page(PageUndoRecord {
            images: vec![left.clone(), right.clone()],
            lokey: path.lokey.clone(),
        });

        self.arena.modify(path.blkno, |page| {
            if let Some(tuples) = page.tuples_mut() {
                tuples.extend(right.tuples().iter().cloned());
            }
            page.header.hikey = right.header.hikey.clone();
            page.header.flags.rightmost = right.is_rightmost();
            page.header.csn = csn;
            page.header.undo = Some(location);
        })?;
        self.arena.modify(parent.blkno, |page| {
            if let Some(items) = page.items_mut() {
                items.remove(parent.index + 1);
            }
        })?;
        self.arena.free(right_blkno);
        debug!("merged leaf {} into {}", right_blkno, path.blkno);
        Ok(())
    }

    /// Splits the level-1 page holding separator `at`; `at` becomes the low
    /// key of the new right page.
    pub fn split_internal(&self, at: &Key) -> SeqScanResult<()> {
        let _writer = self.writer.lock();
        let path = self.leaf_path(at)?;
        let (page_step, upper) = path
            .steps
            .split_last()
            .ok_or_else(|| SeqScanError::Internal("tree has no internal level".to_string()))?;
        let (_, page) = self.read_image(page_step.blkno)?;
        let j = page
            .items()
            .iter()
            .skip(1)
            .position(|item| item.key == *at)
            .map(|p| p + 1)
            .ok_or_else(|| {
                SeqScanError::Internal(format!("{:?} is not a separator of its page", at))
            })?;

        let mut right_items = page.items()[j..].to_vec();
        right_items[0].key = Key::default();
        let right = PageImage::new_internal(
            page.level(),
            PageFlags {
                leftmost: false,
                rightmost: page.is_rightmost(),
            },
            page.csn(),
            page.header.hikey.clone(),
            right_items,
        );
        let (rblkno, rcc) = self.arena.allocate(right);
        self.insert_downlink(upper, page_step.blkno, at, Downlink::in_memory(rblkno, rcc))?;
        self.arena.modify(page_step.blkno, |page| {
            if let Some(items) = page.items_mut() {
                items.truncate(j);
            }
            page.header.hikey = Some(at.clone());
            page.header.flags.rightmost = false;
        })?;
        debug!(
            "split internal page {} at {:?} -> {}",
            page_step.blkno, at, rblkno
        );
        Ok(())
    }

    /// Moves the boundary between two neighbouring level-1 pages from `sep`
    /// down to `new_sep`, shifting the tuples in `[new_sep, sep)` from the
    /// last leaf of the left page into the first leaf of the right page.
    pub fn shift_boundary(&self, sep: &Key, new_sep: &Key, csn: Csn) -> SeqScanResult<()> {
        let _writer = self.writer.lock();
        if new_sep >= sep {
            return Err(SeqScanError::Internal(
                "boundary can only move left".to_string(),
            ));
        }
        let right_path = self.leaf_path(sep)?;
        let left_path = self.leaf_path(new_sep)?;
        let (Some(q_step), Some(p_step)) = (right_path.steps.last(), left_path.steps.last())
        else {
            return Err(SeqScanError::Internal(
                "tree has no internal level".to_string(),
            ));
        };
        let n = right_path.steps.len();
        if n < 2 || q_step.index != 0 || right_path.lokey.as_ref() != Some(sep) {
            return Err(SeqScanError::Internal(format!(
                "{:?} is not a boundary between internal pages",
                sep
            )));
        }
        let root_step = right_path.steps[n - 2];
        let (_, a_old) = self.read_image(left_path.blkno)?;
        let (_, b_old) = self.read_image(right_path.blkno)?;
        if a_old.hikey() != Some(sep) {
            return Err(SeqScanError::Internal(format!(
                "{:?} does not fall in the leaf left of {:?}",
                new_sep, sep
            )));
        }
        if left_path.lokey.as_ref().is_some_and(|lo| lo >= new_sep) {
            return Err(SeqScanError::Internal(format!(
                "{:?} would empty the left leaf",
                new_sep
            )));
        }

        let a_undo = self.undo.push_page(PageUndoRecord {
            images: vec![a_old.clone()],
            lokey: left_path.lokey.clone(),
        });
        let b_undo = self.undo.push_page(PageUndoRecord {
            images: vec![a_old.clone(), b_old.clone()],
            lokey: Some(new_sep.clone()),
        });
        let pos = a_old.leaf_lower_bound(new_sep);
        let moved = a_old.tuples()[pos..].to_vec();

        self.arena.modify(right_path.blkno, |page| {
            if let Some(tuples) = page.tuples_mut() {
                tuples.splice(0..0, moved);
            }
            page.header.csn = csn;
            page.header.undo = Some(b_undo);
        })?;
        self.arena.modify(root_step.blkno, |page| {
            if let Some(items) = page.items_mut() {
                items[root_step.index].key = new_sep.clone();
            }
        })?;
        self.arena.modify(p_step.blkno, |page| {
            page.header.hikey = Some(new_sep.clone());
        })?;
        self.arena.modify(left_path.blkno, |page| {
            if let Some(tuples) = page.tuples_mut() {
                tuples.truncate(pos);
            }
            page.header.hikey = Some(new_sep.clone());
            page.header.csn = csn;
            page.header.undo = Some(a_undo);
        })?;
        debug!("moved internal boundary {:?} -> {:?}", sep, new_sep);
        Ok(())
    }

    /// Writes the leaf containing `key` to disk and frees its slot.
    pub fn evict(&self, key: &Key) -> SeqScanResult<DiskExtent> {
        let _writer = self.writer.lock();
        let path = self.leaf_path(key)?;
        let parent = *path
            .steps
            .last()
            .ok_or_else(|| SeqScanError::Internal("root leaf stays in memory".to_string()))?;
        let (_, image) = self.read_image(path.blkno)?;
        let extent = self.disk.write_page(&image)?;
        self.set_downlink(parent.blkno, parent.index, Downlink::OnDisk(extent))?;
        self.arena.free(path.blkno);
        Ok(extent)
    }

    /// Brings the leaf containing `key` back into memory.
    pub fn load(&self, key: &Key) -> SeqScanResult<()> {
        let _writer = self.writer.lock();
        self.leaf_path(key).map(|_| ())
    }

    /// Marks the on-disk leaf containing `key` as being loaded. Readers that
    /// meet the downlink wait until [`MemTree::complete_io`] runs.
    pub fn begin_io(&self, key: &Key) -> SeqScanResult<IoNum> {
        let _writer = self.writer.lock();
        let (parent, index, downlink) = self.locate_leaf_downlink(key)?;
        let extent = downlink
            .extent()
            .ok_or_else(|| SeqScanError::Internal(format!("leaf of {:?} is not on disk", key)))?;
        let io_num = self.next_io.fetch_add(1, Ordering::SeqCst);
        self.io.start(io_num);
        self.pending_io.lock().insert(
            io_num,
            PendingLoad {
                key: key.clone(),
                extent,
            },
        );
        self.set_downlink(parent, index, Downlink::InIo(io_num))?;
        Ok(io_num)
    }

    pub fn complete_io(&self, io_num: IoNum) -> SeqScanResult<()> {
        let pending = self
            .pending_io
            .lock()
            .remove(&io_num)
            .ok_or_else(|| SeqScanError::Internal(format!("io {} is not in flight", io_num)))?;
        let result = {
            let _writer = self.writer.lock();
            self.locate_leaf_downlink(&pending.key)
                .and_then(|(parent, index, _)| {
                    let image = self.disk.read_page(pending.extent)?;
                    let (blkno, cc) = self.arena.allocate(image);
                    self.set_downlink(parent, index, Downlink::in_memory(blkno, cc))
                })
        };
        self.io.finish(io_num);
        result
    }

    /// Reclaims all undo history written so far.
    pub fn truncate_undo(&self) {
        self.undo.truncate(self.undo.end());
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoints.begin_checkpoint();
        self.checkpoints.complete_checkpoint()
    }

    /// Every stored tuple in key order, tombstones included, ignoring undo.
    pub fn physical_tuples(&self) -> SeqScanResult<Vec<LeafTuple>> {
        let mut out = Vec::new();
        let mut key: Option<Key> = None;
        loop {
            let found = self.find_page(key.as_ref(), 0)?;
            out.extend(found.image.tuples().iter().cloned());
            match found.image.hikey() {
                Some(hikey) => key = Some(hikey.clone()),
                None => return Ok(out),
            }
        }
    }

    fn read_image(&self, blkno: BlockNumber) -> SeqScanResult<(ChangeCount, PageImage)> {
        self.arena
            .read(blkno)
            .ok_or_else(|| SeqScanError::Internal(format!("block {} is free", blkno)))
    }

    fn set_downlink(
        &self,
        parent: BlockNumber,
        index: usize,
        downlink: Downlink,
    ) -> SeqScanResult<()> {
        self.arena.modify(parent, |page| {
            if let Some(item) = page.items_mut().and_then(|items| items.get_mut(index)) {
                item.downlink = downlink;
            }
        })
    }

    fn load_child(
        &self,
        parent: BlockNumber,
        index: usize,
        extent: DiskExtent,
    ) -> SeqScanResult<BlockNumber> {
        let image = self.disk.read_page(extent)?;
        let (blkno, cc) = self.arena.allocate(image);
        self.set_downlink(parent, index, Downlink::in_memory(blkno, cc))?;
        Ok(blkno)
    }

    /// Writer-side descent. On-disk children on the way are loaded.
    fn leaf_path(&self, key: &Key) -> SeqScanResult<LeafPath> {
        let mut blkno = *self.root.read();
        let mut steps = Vec::new();
        let mut lokey = None;
        loop {
            let (_, image) = self.read_image(blkno)?;
            if image.is_leaf() {
                return Ok(LeafPath {
                    steps,
                    blkno,
                    lokey,
                });
            }
            let index = image.child_index(key);
            let item = &image.items()[index];
            if index > 0 {
                lokey = Some(item.key.clone());
            }
            steps.push(PathStep { blkno, index });
            blkno = match item.downlink {
                Downlink::InMemory { blkno, .. } => blkno,
                Downlink::OnDisk(extent) => self.load_child(blkno, index, extent)?,
                Downlink::InIo(io_num) => {
                    return Err(SeqScanError::Internal(format!(
                        "io {} in flight under a writer",
                        io_num
                    )))
                }
            };
        }
    }

    fn locate_leaf_downlink(&self, key: &Key) -> SeqScanResult<(BlockNumber, usize, Downlink)> {
        let mut blkno = *self.root.read();
        loop {
            let (_, image) = self.read_image(blkno)?;
            if image.is_leaf() {
                return Err(SeqScanError::Internal(
                    "root leaf has no downlink".to_string(),
                ));
            }
            let index = image.child_index(key);
            let downlink = image.items()[index].downlink;
            if image.level() == 1 {
                return Ok((blkno, index, downlink));
            }
            blkno = downlink.blkno().ok_or_else(|| {
                SeqScanError::Internal("internal pages stay in memory".to_string())
            })?;
        }
    }

    fn insert_downlink(
        &self,
        upper: &[PathStep],
        child: BlockNumber,
        key: &Key,
        downlink: Downlink,
    ) -> SeqScanResult<()> {
        match upper.last() {
            Some(parent) => self.arena.modify(parent.blkno, |page| {
                if let Some(items) = page.items_mut() {
                    items.insert(parent.index + 1, InternalItem::new(key.clone(), downlink));
                }
            }),
            None => {
                let (child_cc, child_image) = self.read_image(child)?;
                let items = vec![
                    InternalItem::new(Key::default(), Downlink::in_memory(child, child_cc)),
                    InternalItem::new(key.clone(), downlink),
                ];
                let flags = PageFlags {
                    leftmost: true,
                    rightmost: true,
                };
                let root = PageImage::new_internal(
                    child_image.level() + 1,
                    flags,
                    child_image.csn(),
                    None,
                    items,
                );
                let (blkno, _) = self.arena.allocate(root);
                *self.root.write() = blkno;
                debug!(
                    "tree grew a new root {} at level {}",
                    blkno,
                    child_image.level() + 1
                );
                Ok(())
            }
        }
    }
}

fn leaf_tuples_mut(page: &mut PageImage) -> SeqScanResult<&mut Vec<LeafTuple>> {
    page.tuples_mut()
        .ok_or_else(|| SeqScanError::Internal("expected a leaf page".to_string()))
}

impl PageAccess for MemTree {
    fn try_read_page(
        &self,
        blkno: BlockNumber,
        change_count: ChangeCount,
    ) -> SeqScanResult<ReadPage> {
        Ok(match self.arena.try_read(blkno, change_count) {
            Some(image) => ReadPage::Ok(image),
            None => ReadPage::Stale,
        })
    }

    fn read_page_from_disk(&self, extent: DiskExtent) -> SeqScanResult<PageImage> {
        self.disk.read_page(extent)
    }

    fn find_page(&self, key: Option<&Key>, level: u8) -> SeqScanResult<FoundPage> {
        'restart: for _ in 0..MAX_FIND_RESTARTS {
            let read_csn = self.last_csn.load(Ordering::SeqCst);
            let mut blkno = *self.root.read();
            let Some((mut change_count, mut image)) = self.arena.read(blkno) else {
                continue 'restart;
            };
            let mut lokey = None;
            loop {
                if image.level() <= level {
                    let index = match key {
                        Some(key) if image.is_leaf() => image.leaf_lower_bound(key),
                        Some(key) => image.child_index(key),
                        None => 0,
                    };
                    return Ok(FoundPage {
                        image,
                        blkno,
                        change_count,
                        index,
                        lokey,
                        read_csn,
                    });
                }
                let index = key.map(|k| image.child_index(k)).unwrap_or(0);
                let item = &image.items()[index];
                if index > 0 {
                    lokey = Some(item.key.clone());
                }
                match item.downlink {
                    Downlink::InMemory {
                        blkno: child,
                        change_count: child_cc,
                    } => match self.arena.try_read(child, child_cc) {
                        Some(child_image) => {
                            blkno = child;
                            change_count = child_cc;
                            image = child_image;
                        }
                        None => continue 'restart,
                    },
                    Downlink::OnDisk(extent) => {
                        image = self.disk.read_page(extent)?;
                        blkno = INVALID_BLKNO;
                        change_count = INVALID_CHANGE_COUNT;
                    }
                    Downlink::InIo(io_num) => {
                        self.wait_for_io(io_num);
                        continue 'restart;
                    }
                }
            }
        }
        Err(SeqScanError::Internal(format!(
            "page search for {:?} did not settle after {} restarts",
            key, MAX_FIND_RESTARTS
        )))
    }

    fn wait_for_io(&self, io_num: IoNum) {
        self.io.wait(io_num, self.config.io_wait_timeout);
    }

    fn current_csn(&self) -> Csn {
        self.last_csn.load(Ordering::SeqCst)
    }
}

impl UndoAccess for MemTree {
    fn page_from_undo(
        &self,
        location: UndoLocation,
        key: Option<&Key>,
    ) -> SeqScanResult<Option<UndoPageImage>> {
        self.undo.page_from_undo(location, key)
    }

    fn tuple_version(&self, location: UndoLocation) -> SeqScanResult<Option<LeafTuple>> {
        self.undo.tuple_version(location)
    }
}

impl TreeAccess for MemTree {
    fn checkpoints(&self) -> &CheckpointState {
        &self.checkpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(range: std::ops::RangeInclusive<u64>) -> Vec<(Key, Bytes)> {
        range
            .map(|k| (Key::from_u64(k), Bytes::from(k.to_string())))
            .collect()
    }

    fn keys(tree: &MemTree) -> Vec<u64> {
        tree.physical_tuples()
            .unwrap()
            .iter()
            .filter(|t| !t.header.deleted)
            .filter_map(|t| t.key.as_u64())
            .collect()
    }

    fn small() -> MemTreeConfig {
        MemTreeConfig::default()
            .with_leaf_capacity(4usize)
            .with_internal_fanout(3usize)
    }

    #[test]
    fn bulk_load_builds_three_levels() {
        let tree = MemTree::bulk_load(small(), rows(1..=40));
        assert_eq!(tree.root_level().unwrap(), 2);
        assert_eq!(keys(&tree), (1..=40).collect::<Vec<_>>());

        let first = tree.find_page(None, 1).unwrap();
        assert!(first.image.is_leftmost());
        assert_eq!(first.lokey, None);
        let next = tree.find_page(first.image.hikey(), 1).unwrap();
        assert_eq!(next.lokey.as_ref(), first.image.hikey());
        assert_eq!(next.index, 0);
    }

    #[test]
    fn single_leaf_tree_has_no_internal_level() {
        let tree = MemTree::bulk_load(small(), rows(1..=3));
        assert_eq!(tree.root_level().unwrap(), 0);
        let found = tree.find_page(None, 1).unwrap();
        assert!(found.image.is_leaf());
        assert!(found.image.is_leftmost() && found.image.is_rightmost());
    }

    #[test]
    fn split_and_merge_keep_contents() {
        let tree = MemTree::bulk_load(small(), rows(1..=12));
        let csn = tree.commit_csn();
        tree.split_leaf(&Key::from_u64(3), csn).unwrap();
        assert_eq!(keys(&tree), (1..=12).collect::<Vec<_>>());
        let left = tree.find_page(Some(&Key::from_u64(1)), 0).unwrap();
        assert_eq!(left.image.hikey(), Some(&Key::from_u64(3)));

        let csn = tree.commit_csn();
        tree.merge_leaves(&Key::from_u64(1), csn).unwrap();
        assert_eq!(keys(&tree), (1..=12).collect::<Vec<_>>());
        let merged = tree.find_page(Some(&Key::from_u64(1)), 0).unwrap();
        assert_eq!(merged.image.hikey(), Some(&Key::from_u64(5)));
        assert_eq!(merged.image.csn(), csn);
    }

    #[test]
    fn split_grows_root_of_single_leaf() {
        let tree = MemTree::bulk_load(small(), rows(1..=3));
        let csn = tree.commit_csn();
        tree.split_leaf(&Key::from_u64(2), csn).unwrap();
        assert_eq!(tree.root_level().unwrap(), 1);
        assert_eq!(keys(&tree), vec![1, 2, 3]);
    }

    #[test]
    fn evict_and_load_round_trip() {
        let tree = MemTree::bulk_load(small(), rows(1..=12));
        let extent = tree.evict(&Key::from_u64(6)).unwrap();
        assert_eq!(tree.disk().len(), 1);
        let (_, _, downlink) = tree.locate_leaf_downlink(&Key::from_u64(6)).unwrap();
        assert_eq!(downlink, Downlink::OnDisk(extent));
        assert_eq!(keys(&tree), (1..=12).collect::<Vec<_>>());

        tree.load(&Key::from_u64(6)).unwrap();
        let (_, _, downlink) = tree.locate_leaf_downlink(&Key::from_u64(6)).unwrap();
        assert!(downlink.is_in_memory());
    }

    #[test]
    fn row_changes_chain_versions() {
        let tree = MemTree::bulk_load(small(), rows(1..=4));
        let csn = tree.commit_csn();
        tree.put(Key::from_u64(2), Bytes::from_static(b"new"), csn)
            .unwrap();
        assert!(tree.delete(Key::from_u64(3), csn).unwrap());
        assert!(!tree.delete(Key::from_u64(99), csn).unwrap());

        let tuples = tree.physical_tuples().unwrap();
        let two = &tuples[1];
        assert_eq!(two.value, Bytes::from_static(b"new"));
        let prev = tree
            .tuple_version(two.header.prev_version.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(prev.value, Bytes::from("2"));
        assert!(tuples[2].header.deleted);
    }

    #[test]
    fn delete_range_records_page_undo() {
        let tree = MemTree::bulk_load(small(), rows(1..=12));
        let csn = tree.commit_csn();
        let removed = tree
            .delete_range(&Key::from_u64(3), &Key::from_u64(9), csn)
            .unwrap();
        assert_eq!(removed, 7);
        assert_eq!(keys(&tree), vec![1, 2, 10, 11, 12]);

        let page = tree.find_page(Some(&Key::from_u64(5)), 0).unwrap().image;
        assert_eq!(page.csn(), csn);
        let before = tree.read_page_as_of(page, csn - 1).unwrap();
        assert_eq!(before.tuples().len(), 4);
    }

    #[test]
    fn shift_boundary_moves_tuples_right() {
        let tree = MemTree::bulk_load(small(), rows(1..=24));
        // leaves of four keys, three leaves per internal page: boundary at 13
        let csn = tree.commit_csn();
        tree.shift_boundary(&Key::from_u64(13), &Key::from_u64(11), csn)
            .unwrap();
        assert_eq!(keys(&tree), (1..=24).collect::<Vec<_>>());
        let right = tree.find_page(Some(&Key::from_u64(11)), 1).unwrap();
        assert_eq!(right.lokey, Some(Key::from_u64(11)));
        let leaf = tree.find_page(Some(&Key::from_u64(11)), 0).unwrap();
        assert_eq!(leaf.image.tuples()[0].key, Key::from_u64(11));
    }

    #[test]
    fn in_flight_io_blocks_readers_until_complete() {
        let tree = std::sync::Arc::new(MemTree::bulk_load(small(), rows(1..=12)));
        tree.evict(&Key::from_u64(6)).unwrap();
        let io = tree.begin_io(&Key::from_u64(6)).unwrap();

        let loader = {
            let tree = tree.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                tree.complete_io(io).unwrap();
            })
        };
        let found = tree.find_page(Some(&Key::from_u64(6)), 0).unwrap();
        assert_ne!(found.blkno, INVALID_BLKNO);
        loader.join().unwrap();
    }
}
