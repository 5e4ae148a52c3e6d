use log::debug;

use crate::buffer::{Key, INVALID_BLKNO};
use crate::error::SeqScanResult;
use crate::scan::callbacks::ScanCallbacks;
use crate::scan::cursor::MergeCursor;
use crate::scan::walker::KeyRange;
use crate::scan::{LeafHint, RawTuple, ScanTuple};
use crate::storage::TreeAccess;
use crate::transaction::Snapshot;

/// Point-search based reader of one key range, used where the internal-page
/// walk cannot be trusted. Every leaf is located from the root, so
/// concurrent splits and merges cannot make it skip or repeat keys.
#[derive(Debug)]
pub(crate) struct FallbackIterator {
    cursor: Option<MergeCursor>,
    /// Key the next leaf is searched by. `None` is the leftmost leaf.
    position: Option<Key>,
    end: Option<Key>,
    done: bool,
}

impl FallbackIterator {
    pub(crate) fn new(range: KeyRange) -> Self {
        debug!("fallback iterator over [{:?}, {:?})", range.low, range.high);
        Self {
            cursor: None,
            position: range.low,
            end: range.high,
            done: false,
        }
    }

    pub(crate) fn next_visible<T>(
        &mut self,
        tree: &T,
        snapshot: &Snapshot,
        callbacks: &mut Option<Box<dyn ScanCallbacks>>,
    ) -> SeqScanResult<Option<ScanTuple>>
    where
        T: TreeAccess + ?Sized,
    {
        loop {
            if let Some(cursor) = self.cursor.as_mut() {
                if let Some(tuple) = cursor.next_visible(tree, snapshot, callbacks)? {
                    return Ok(Some(tuple));
                }
                self.finish_leaf();
            }
            if !self.open_leaf(tree)? {
                return Ok(None);
            }
        }
    }

    pub(crate) fn next_raw<T>(&mut self, tree: &T) -> SeqScanResult<Option<RawTuple>>
    where
        T: TreeAccess + ?Sized,
    {
        loop {
            if let Some(cursor) = self.cursor.as_mut() {
                if let Some(tuple) = cursor.next_raw() {
                    return Ok(Some(tuple));
                }
                self.finish_leaf();
            }
            if !self.open_leaf(tree)? {
                return Ok(None);
            }
        }
    }

    /// Moves the search position to the high key of the leaf just read, or
    /// ends the iteration when that leaf reaches the end of the range.
    fn finish_leaf(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        match cursor.live_image().hikey() {
            Some(hikey) if self.end.as_ref().map_or(true, |end| hikey < end) => {
                self.position = Some(hikey.clone());
            }
            _ => self.done = true,
        }
    }

    fn open_leaf<T>(&mut self, tree: &T) -> SeqScanResult<bool>
    where
        T: TreeAccess + ?Sized,
    {
        if self.done {
            return Ok(false);
        }
        let found = tree.find_page(self.position.as_ref(), 0)?;
        let hint = if found.blkno == INVALID_BLKNO {
            LeafHint::invalid()
        } else {
            LeafHint::new(found.blkno, found.change_count)
        };
        self.cursor = Some(MergeCursor::bounded(
            found.image,
            hint,
            self.position.clone(),
            self.end.clone(),
        ));
        Ok(true)
    }
}
