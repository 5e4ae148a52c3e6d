use parking_lot::{Mutex, RwLock};

use crate::buffer::{BlockNumber, ChangeCount, PageImage, CHANGE_COUNT_MASK};
use crate::error::{SeqScanError, SeqScanResult};

#[derive(Debug, Default)]
struct PageSlot {
    change_count: ChangeCount,
    image: Option<PageImage>,
}

/// Fixed-size page slots addressed by block number.
///
/// A slot's change count moves whenever the slot is freed, so a reader that
/// remembers `(blkno, change_count)` can tell a reused slot from the page it
/// was looking for. Reads copy the image out under a short read lock; no lock
/// is held by the caller afterwards.
#[derive(Debug, Default)]
pub struct PageArena {
    slots: RwLock<Vec<RwLock<PageSlot>>>,
    free_list: Mutex<Vec<BlockNumber>>,
}

impl PageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, image: PageImage) -> (BlockNumber, ChangeCount) {
        let reused = self.free_list.lock().pop();
        if let Some(blkno) = reused {
            let slots = self.slots.read();
            let mut slot = slots[blkno as usize].write();
            slot.image = Some(image);
            return (blkno, slot.change_count);
        }
        let mut slots = self.slots.write();
        let blkno = slots.len() as BlockNumber;
        slots.push(RwLock::new(PageSlot {
            change_count: 0,
            image: Some(image),
        }));
        (blkno, 0)
    }

    /// Optimistic read: returns the image only while the slot still holds the
    /// page identified by `change_count`.
    pub fn try_read(&self, blkno: BlockNumber, change_count: ChangeCount) -> Option<PageImage> {
        let slots = self.slots.read();
        let slot = slots.get(blkno as usize)?.read();
        if slot.change_count != change_count {
            return None;
        }
        slot.image.clone()
    }

    pub fn read(&self, blkno: BlockNumber) -> Option<(ChangeCount, PageImage)> {
        let slots = self.slots.read();
        let slot = slots.get(blkno as usize)?.read();
        slot.image.clone().map(|image| (slot.change_count, image))
    }

    pub fn change_count(&self, blkno: BlockNumber) -> Option<ChangeCount> {
        let slots = self.slots.read();
        let slot = slots.get(blkno as usize)?.read();
        Some(slot.change_count)
    }

    /// Applies `f` to the image stored in `blkno` in place.
    pub fn modify<R>(
        &self,
        blkno: BlockNumber,
        f: impl FnOnce(&mut PageImage) -> R,
    ) -> SeqScanResult<R> {
        let slots = self.slots.read();
        let mut slot = slots
            .get(blkno as usize)
            .ok_or_else(|| SeqScanError::Internal(format!("block {} out of range", blkno)))?
            .write();
        let image = slot
            .image
            .as_mut()
            .ok_or_else(|| SeqScanError::Internal(format!("block {} is free", blkno)))?;
        Ok(f(image))
    }

    /// Releases the slot. Outstanding downlinks to it become stale.
    pub fn free(&self, blkno: BlockNumber) -> Option<PageImage> {
        let image = {
            let slots = self.slots.read();
            let mut slot = slots.get(blkno as usize)?.write();
            slot.change_count = (slot.change_count + 1) & CHANGE_COUNT_MASK;
            slot.image.take()
        };
        if image.is_some() {
            self.free_list.lock().push(blkno);
        }
        image
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
