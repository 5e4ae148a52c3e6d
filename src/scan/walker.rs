use log::debug;

use crate::buffer::{Downlink, Key, PageImage};
use crate::error::{SeqScanError, SeqScanResult};
use crate::storage::{FoundPage, PageAccess};
use crate::transaction::Csn;

const CURRENT_SLOT: usize = 0;

/// Key bounds of one downlink's subtree. `None` is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub low: Option<Key>,
    pub high: Option<Key>,
}

impl KeyRange {
    pub fn new(low: Option<Key>, high: Option<Key>) -> Self {
        Self { low, high }
    }
}

#[derive(Debug)]
pub(crate) enum WalkStep {
    Downlink {
        downlink: Downlink,
        range: KeyRange,
        read_csn: Csn,
    },
    /// Range whose page linkage could not be trusted; read it by point
    /// search.
    Iterate(KeyRange),
    /// The tree has no internal level.
    SingleLeaf(FoundPage),
    Exhausted,
}

/// A level-1 page as loaded by the walk.
#[derive(Debug, Clone)]
pub(crate) struct InternalPage {
    image: PageImage,
    /// High key of the page read before this one, `None` for the first.
    prev_hikey: Option<Key>,
    /// Item the relocation search landed on.
    start: usize,
    /// First item still to be handed out.
    first_offset: usize,
    read_csn: Csn,
    /// Range left unread by a moved left boundary. Handed out before the
    /// page's items once the page becomes current.
    repair: Option<KeyRange>,
}

impl InternalPage {
    fn low_key(&self, offset: usize) -> Option<Key> {
        if offset != self.start {
            Some(self.image.items()[offset].key.clone())
        } else if !self.image.is_leftmost() {
            self.prev_hikey.clone()
        } else {
            None
        }
    }

    fn high_key(&self, offset: usize) -> Option<Key> {
        match self.image.items().get(offset + 1) {
            Some(item) => Some(item.key.clone()),
            None => self.image.hikey().cloned(),
        }
    }

    fn step(&self, offset: usize) -> WalkStep {
        WalkStep::Downlink {
            downlink: self.image.items()[offset].downlink,
            range: KeyRange::new(self.low_key(offset), self.high_key(offset)),
            read_csn: self.read_csn,
        }
    }

    fn next_hikey(&self) -> SeqScanResult<Key> {
        self.image
            .hikey()
            .cloned()
            .ok_or_else(|| SeqScanError::Corrupt("internal page without high key".to_string()))
    }
}

enum PageLoad {
    Internal(InternalPage),
    SingleLeaf(FoundPage),
}

/// Finds the level-1 page covering `prev_hikey`, or the leftmost one.
///
/// The left bound of the item the search lands on must equal `prev_hikey`.
/// When it does not, keys moved between the two page reads; the range from
/// `prev_hikey` to the end of that item is kept on the page for the
/// point-search iterator and the walk continues with the following item.
fn load_internal_page<T>(tree: &T, prev_hikey: Option<Key>) -> SeqScanResult<PageLoad>
where
    T: PageAccess + ?Sized,
{
    let found = tree.find_page(prev_hikey.as_ref(), 1)?;
    if found.image.is_leaf() {
        if prev_hikey.is_some() {
            return Err(SeqScanError::Internal(
                "internal level disappeared during the scan".to_string(),
            ));
        }
        return Ok(PageLoad::SingleLeaf(found));
    }

    let start = found.index;
    let mut page = InternalPage {
        image: found.image,
        prev_hikey,
        start,
        first_offset: start,
        read_csn: found.read_csn,
        repair: None,
    };
    debug!(
        "loaded internal page {} ({} items, start {}, csn {})",
        found.blkno,
        page.image.len(),
        start,
        page.read_csn
    );

    if let Some(prev) = page.prev_hikey.clone() {
        let left_bound = if start > 0 {
            page.image.items().get(start).map(|item| &item.key)
        } else {
            found.lokey.as_ref()
        };
        if left_bound != Some(&prev) {
            debug!(
                "internal page boundary moved: expected {:?}, found {:?}",
                prev, left_bound
            );
            page.repair = Some(KeyRange::new(Some(prev), page.high_key(start)));
            page.first_offset = start + 1;
        }
    }
    Ok(PageLoad::Internal(page))
}

/// Walk over the level-1 pages in key order.
///
/// The state holds two page slots so that cooperating workers can prefetch
/// the next page while the current one is still being handed out. Slots
/// swap roles on rotation; page images are never copied between them.
#[derive(Debug, Default)]
pub(crate) struct WalkState {
    slots: [Option<InternalPage>; 2],
    current: usize,
    offset: usize,
    first_page_loaded: bool,
    single_leaf: bool,
}

impl WalkState {
    pub(crate) fn is_single_leaf(&self) -> bool {
        self.single_leaf
    }

    pub(crate) fn next_step<T>(&mut self, tree: &T, prefetch: bool) -> SeqScanResult<WalkStep>
    where
        T: PageAccess + ?Sized,
    {
        loop {
            if self.single_leaf {
                return Ok(WalkStep::Exhausted);
            }

            if let Some(page) = &mut self.slots[self.current] {
                if let Some(range) = page.repair.take() {
                    return Ok(WalkStep::Iterate(range));
                }
                if self.offset < page.image.len() {
                    let step = page.step(self.offset);
                    self.offset += 1;
                    return Ok(step);
                }
                if page.image.is_rightmost() {
                    return Ok(WalkStep::Exhausted);
                }
                let hikey = page.next_hikey()?;
                self.slots[self.current] = None;
                self.rotate(tree, hikey, prefetch)?;
                continue;
            }

            if self.first_page_loaded {
                return Ok(WalkStep::Exhausted);
            }
            self.first_page_loaded = true;
            match load_internal_page(tree, None)? {
                PageLoad::SingleLeaf(found) => {
                    debug!("tree is a single leaf page");
                    self.single_leaf = true;
                    return Ok(WalkStep::SingleLeaf(found));
                }
                PageLoad::Internal(page) => {
                    self.current = CURRENT_SLOT;
                    self.offset = page.first_offset;
                    self.slots[self.current] = Some(page);
                }
            }
            if prefetch {
                self.prefetch(tree)?;
            }
        }
    }

    /// Makes the next page current: the prefetched one if present,
    /// otherwise a fresh load.
    fn rotate<T>(&mut self, tree: &T, hikey: Key, prefetch: bool) -> SeqScanResult<()>
    where
        T: PageAccess + ?Sized,
    {
        let next = 1 - self.current;
        if self.slots[next].is_some() {
            debug!("rotating internal page slot {} -> {}", self.current, next);
            self.current = next;
        } else {
            self.install(self.current, load_internal_page(tree, Some(hikey))?)?;
        }
        self.offset = self.slots[self.current]
            .as_ref()
            .map(|page| page.first_offset)
            .unwrap_or(0);
        if prefetch {
            self.prefetch(tree)?;
        }
        Ok(())
    }

    fn prefetch<T>(&mut self, tree: &T) -> SeqScanResult<()>
    where
        T: PageAccess + ?Sized,
    {
        let next = 1 - self.current;
        if self.slots[next].is_some() {
            return Ok(());
        }
        let hikey = match &self.slots[self.current] {
            Some(page) if !page.image.is_rightmost() => page.next_hikey()?,
            _ => return Ok(()),
        };
        self.install(next, load_internal_page(tree, Some(hikey))?)
    }

    fn install(&mut self, slot: usize, load: PageLoad) -> SeqScanResult<()> {
        match load {
            PageLoad::Internal(page) => {
                self.slots[slot] = Some(page);
                Ok(())
            }
            PageLoad::SingleLeaf(_) => Err(SeqScanError::Internal(
                "leaf found where an internal page was expected".to_string(),
            )),
        }
    }
}
