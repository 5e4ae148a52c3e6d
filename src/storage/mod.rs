//! Storage collaborators consumed by the sequential scan.
//!
//! The scan only sees the traits below. [`MemTree`] is the in-memory
//! implementation used by the tests and by embedders that do not bring their
//! own page store.

pub mod disk;
pub mod mem_tree;
pub mod undo;

pub use disk::DiskStore;
pub use mem_tree::MemTree;
pub use undo::{PageUndoRecord, UndoLocation, UndoLog, UndoPageImage};

use crate::buffer::{BlockNumber, ChangeCount, DiskExtent, IoNum, Key, LeafTuple, PageImage};
use crate::error::{SeqScanError, SeqScanResult};
use crate::transaction::{CheckpointState, Csn};

/// Outcome of an optimistic in-memory page read.
#[derive(Debug, Clone)]
pub enum ReadPage {
    Ok(PageImage),
    /// The slot no longer holds the page the downlink pointed at.
    Stale,
}

/// Result of a point search down to a given level.
#[derive(Debug, Clone)]
pub struct FoundPage {
    pub image: PageImage,
    /// Block of the found page. `INVALID_BLKNO` when it was read from disk.
    pub blkno: BlockNumber,
    pub change_count: ChangeCount,
    /// On internal pages the child covering the search key, on leaves the
    /// first tuple not less than it.
    pub index: usize,
    /// Low bound of the found page taken from its parent. `None` when the
    /// page is the leftmost of its level.
    pub lokey: Option<Key>,
    /// CSN the image is consistent with.
    pub read_csn: Csn,
}

pub trait PageAccess: Send + Sync {
    fn try_read_page(&self, blkno: BlockNumber, change_count: ChangeCount)
        -> SeqScanResult<ReadPage>;

    fn read_page_from_disk(&self, extent: DiskExtent) -> SeqScanResult<PageImage>;

    /// Descends from the root to `level` (or the lowest level that exists)
    /// following `key`; `None` follows the leftmost path.
    fn find_page(&self, key: Option<&Key>, level: u8) -> SeqScanResult<FoundPage>;

    /// Blocks until the page load guarded by `io_num` completes or the wait
    /// times out. The caller re-resolves the downlink either way.
    fn wait_for_io(&self, io_num: IoNum);

    /// Latest assigned commit sequence number.
    fn current_csn(&self) -> Csn;
}

pub trait UndoAccess: Send + Sync {
    /// Page image stored in the page-level undo record at `location`.
    /// Records covering more than one page pick the image containing `key`,
    /// or the one containing the record's own low key when `key` is `None`.
    /// Returns `None` once the record has been reclaimed.
    fn page_from_undo(
        &self,
        location: UndoLocation,
        key: Option<&Key>,
    ) -> SeqScanResult<Option<UndoPageImage>>;

    /// Previous tuple version stored at `location`, `None` once reclaimed.
    fn tuple_version(&self, location: UndoLocation) -> SeqScanResult<Option<LeafTuple>>;

    /// Rewinds `image` through its page-level undo chain until it is not
    /// newer than `csn`.
    fn read_page_as_of(&self, mut image: PageImage, csn: Csn) -> SeqScanResult<PageImage> {
        let mut lokey: Option<Key> = None;
        while image.csn() > csn {
            let location = image.undo().ok_or(SeqScanError::SnapshotTooOld)?;
            let step = self
                .page_from_undo(location, lokey.as_ref())?
                .ok_or(SeqScanError::SnapshotTooOld)?;
            if lokey.is_none() {
                lokey = step.lokey;
            }
            image = step.image;
        }
        Ok(image)
    }
}

/// Everything a scan needs from one tree.
pub trait TreeAccess: PageAccess + UndoAccess {
    fn checkpoints(&self) -> &CheckpointState;
}
