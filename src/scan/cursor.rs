use std::cmp::Ordering;

use log::trace;

use crate::buffer::{Key, LeafTuple, PageImage, XactInfo};
use crate::error::SeqScanResult;
use crate::scan::callbacks::{NextKey, ScanCallbacks};
use crate::scan::historical::{load_first_historical_page, load_next_historical_page};
use crate::scan::{LeafHint, RawTuple, ScanTuple};
use crate::storage::UndoAccess;
use crate::transaction::{resolve_visible_version, Snapshot};

/// Position inside one leaf image. Tuples at or past `end` are out of reach.
#[derive(Debug, Clone)]
pub(crate) struct LeafCursor {
    image: PageImage,
    pos: usize,
    end: usize,
}

impl LeafCursor {
    pub(crate) fn new(image: PageImage) -> Self {
        let end = image.tuples().len();
        Self { image, pos: 0, end }
    }

    pub(crate) fn image(&self) -> &PageImage {
        &self.image
    }

    pub(crate) fn current(&self) -> Option<&LeafTuple> {
        if self.pos < self.end {
            self.image.tuples().get(self.pos)
        } else {
            None
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.pos < self.end
    }

    pub(crate) fn advance(&mut self) {
        if self.pos < self.end {
            self.pos += 1;
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.pos = self.end;
    }

    /// Moves forward to the first tuple not less than `key`.
    pub(crate) fn skip_below(&mut self, key: &Key) {
        self.pos = self.pos.max(self.image.leaf_lower_bound(key));
    }

    /// Hides every tuple not less than `key`.
    pub(crate) fn limit(&mut self, key: &Key) {
        self.end = self.end.min(self.image.leaf_lower_bound(key));
    }

    /// Binary-searches forward to `key`; true when the cursor lands on it.
    pub(crate) fn seek(&mut self, key: &Key) -> bool {
        self.skip_below(key);
        self.current().is_some_and(|t| t.key == *key)
    }
}

#[derive(Debug)]
enum History {
    Pending,
    Active(LeafCursor),
    Off,
}

/// Merges one live (or disk) leaf image with its historical images into a
/// single ordered stream of tuples visible to the snapshot.
///
/// On equal keys the historical tuple wins unless the live tuple belongs to
/// the snapshot's own transaction, in which case the historical duplicate is
/// skipped. Historical images are loaded on the first visible read only;
/// raw reads never consult them.
#[derive(Debug)]
pub(crate) struct MergeCursor {
    live: LeafCursor,
    history: History,
    hint: LeafHint,
    floor: Option<Key>,
    ceiling: Option<Key>,
}

impl MergeCursor {
    pub(crate) fn new(image: PageImage, hint: LeafHint) -> Self {
        Self {
            live: LeafCursor::new(image),
            history: History::Pending,
            hint,
            floor: None,
            ceiling: None,
        }
    }

    /// Cursor restricted to `[floor, ceiling)`.
    pub(crate) fn bounded(
        image: PageImage,
        hint: LeafHint,
        floor: Option<Key>,
        ceiling: Option<Key>,
    ) -> Self {
        let mut cursor = Self::new(image, hint);
        cursor.floor = floor;
        cursor.ceiling = ceiling;
        cursor.restrict_live();
        cursor
    }

    fn restrict_live(&mut self) {
        if let Some(floor) = &self.floor {
            self.live.skip_below(floor);
        }
        if let Some(ceiling) = &self.ceiling {
            self.live.limit(ceiling);
        }
    }

    fn restrict(&self, cursor: &mut LeafCursor) {
        if let Some(floor) = &self.floor {
            cursor.skip_below(floor);
        }
        if let Some(ceiling) = &self.ceiling {
            cursor.limit(ceiling);
        }
    }

    pub(crate) fn live_image(&self) -> &PageImage {
        self.live.image()
    }

    /// Next physically stored tuple of the live image, tombstones included.
    pub(crate) fn next_raw(&mut self) -> Option<RawTuple> {
        let tuple = self.live.current()?.clone();
        self.live.advance();
        Some(RawTuple {
            key: tuple.key,
            value: tuple.value,
            xact: tuple.header.xact,
            deleted: tuple.header.deleted,
            hint: self.hint,
        })
    }

    /// Next tuple visible to `snapshot`, or `None` once the image is done.
    pub(crate) fn next_visible<U>(
        &mut self,
        undo: &U,
        snapshot: &Snapshot,
        callbacks: &mut Option<Box<dyn ScanCallbacks>>,
    ) -> SeqScanResult<Option<ScanTuple>>
    where
        U: UndoAccess + ?Sized,
    {
        if matches!(self.history, History::Pending) {
            self.history = match load_first_historical_page(undo, self.live.image(), snapshot)? {
                Some(page) => {
                    let mut cursor = LeafCursor::new(page.image);
                    if let Some(lokey) = &page.lokey {
                        cursor.skip_below(lokey);
                    }
                    self.restrict(&mut cursor);
                    History::Active(cursor)
                }
                None => History::Off,
            };
        }

        loop {
            while matches!(self.history, History::Active(_)) {
                if !self.settle_history(undo, snapshot)? {
                    break;
                }
                if let Some(cb) = callbacks.as_mut() {
                    self.apply_next_key(&mut **cb);
                }
                let History::Active(hist) = &mut self.history else {
                    break;
                };
                let Some(hist_tuple) = hist.current() else {
                    continue;
                };

                match self.live.current() {
                    None => {
                        let live = self.live.image();
                        if live.cmp_hikey(&hist_tuple.key) != Ordering::Less {
                            trace!("historical image passed the live high key");
                            self.history = History::Off;
                            break;
                        }
                    }
                    Some(live_tuple) => match hist_tuple.key.cmp(&live_tuple.key) {
                        Ordering::Greater => break,
                        Ordering::Equal if snapshot.is_own(live_tuple.header.xact) => {
                            hist.advance();
                            break;
                        }
                        Ordering::Equal => self.live.advance(),
                        Ordering::Less => {}
                    },
                }

                let candidate = hist_tuple.clone();
                hist.advance();
                if let Some(found) = resolve_visible_version(undo, &candidate, snapshot)? {
                    return Ok(Some(self.emit(found)));
                }
            }

            if self.live.is_valid() {
                if let Some(cb) = callbacks.as_mut() {
                    self.apply_next_key(&mut **cb);
                }
            }
            let Some(live_tuple) = self.live.current() else {
                return Ok(None);
            };
            let candidate = live_tuple.clone();
            self.live.advance();
            if let Some(found) = resolve_visible_version(undo, &candidate, snapshot)? {
                return Ok(Some(self.emit(found)));
            }
        }
    }

    /// Makes sure the historical cursor points at a tuple, loading further
    /// historical images of the live page as needed. Returns false once the
    /// history has been dropped.
    fn settle_history<U>(&mut self, undo: &U, snapshot: &Snapshot) -> SeqScanResult<bool>
    where
        U: UndoAccess + ?Sized,
    {
        loop {
            let History::Active(hist) = &self.history else {
                return Ok(false);
            };
            if hist.is_valid() {
                return Ok(true);
            }
            let prev = hist.image();
            if prev.is_rightmost() {
                self.history = History::Off;
                return Ok(false);
            }
            let live = self.live.image();
            if let (Some(hist_hikey), Some(live_hikey)) = (prev.hikey(), live.hikey()) {
                if hist_hikey >= live_hikey {
                    self.history = History::Off;
                    return Ok(false);
                }
            }
            match load_next_historical_page(undo, live, prev, snapshot)? {
                Some(image) => {
                    let mut cursor = LeafCursor::new(image);
                    self.restrict(&mut cursor);
                    self.history = History::Active(cursor);
                }
                None => {
                    self.history = History::Off;
                    return Ok(false);
                }
            }
        }
    }

    /// Lets the caller fast-forward both cursors past keys it does not need.
    fn apply_next_key(&mut self, cb: &mut dyn ScanCallbacks) {
        loop {
            let hist_key = match &self.history {
                History::Active(hist) => hist.current().map(|t| &t.key),
                _ => None,
            };
            let live_key = self.live.current().map(|t| &t.key);
            let smallest = match (live_key, hist_key) {
                (Some(a), Some(b)) => a.min(b).clone(),
                (Some(a), None) | (None, Some(a)) => a.clone(),
                (None, None) => return,
            };

            match cb.next_key(&smallest) {
                NextKey::Continue => return,
                NextKey::SkipPage => {
                    self.live.invalidate();
                    self.history = History::Off;
                    return;
                }
                NextKey::Seek(target) => {
                    if target <= smallest {
                        return;
                    }
                    let live_hit = self.live.seek(&target);
                    let hist_hit = match &mut self.history {
                        History::Active(hist) => hist.seek(&target),
                        _ => false,
                    };
                    if live_hit || hist_hit {
                        return;
                    }
                }
            }
        }
    }

    fn emit(&self, tuple: LeafTuple) -> ScanTuple {
        let csn = match tuple.header.xact {
            XactInfo::Committed(csn) => Some(csn),
            XactInfo::InProgress(_) => None,
        };
        ScanTuple {
            key: tuple.key,
            value: tuple.value,
            csn,
            hint: self.hint,
        }
    }
}
