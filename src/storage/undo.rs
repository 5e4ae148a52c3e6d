use std::collections::VecDeque;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::buffer::{Key, LeafTuple, PageImage};
use crate::error::{SeqScanError, SeqScanResult};
use crate::storage::UndoAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UndoLocation(u64);

impl UndoLocation {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Pre-change images of the pages affected by one structural change, in key
/// order. A merge stores both former pages; a split stores the former page
/// once for each half.
#[derive(Debug, Clone)]
pub struct PageUndoRecord {
    pub images: Vec<PageImage>,
    /// Low bound of the page owning this record, when it starts inside the
    /// stored images rather than at their beginning.
    pub lokey: Option<Key>,
}

#[derive(Debug, Clone)]
pub struct UndoPageImage {
    pub image: PageImage,
    pub lokey: Option<Key>,
}

#[derive(Debug, Clone)]
enum UndoRecord {
    Page(PageUndoRecord),
    Tuple(LeafTuple),
}

#[derive(Debug, Default)]
struct UndoLogInner {
    /// Location of `records[0]`. Everything below has been reclaimed.
    base: u64,
    records: VecDeque<UndoRecord>,
}

#[derive(Debug, Default)]
pub struct UndoLog {
    inner: RwLock<UndoLogInner>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, record: PageUndoRecord) -> UndoLocation {
        self.push(UndoRecord::Page(record))
    }

    pub fn push_tuple(&self, tuple: LeafTuple) -> UndoLocation {
        self.push(UndoRecord::Tuple(tuple))
    }

    fn push(&self, record: UndoRecord) -> UndoLocation {
        let mut inner = self.inner.write();
        let location = UndoLocation(inner.base + inner.records.len() as u64);
        inner.records.push_back(record);
        location
    }

    /// Location the next record will get.
    pub fn end(&self) -> UndoLocation {
        let inner = self.inner.read();
        UndoLocation(inner.base + inner.records.len() as u64)
    }

    /// Oldest location still readable.
    pub fn retained_from(&self) -> UndoLocation {
        UndoLocation(self.inner.read().base)
    }

    /// Reclaims every record below `before`.
    pub fn truncate(&self, before: UndoLocation) {
        let mut inner = self.inner.write();
        let mut reclaimed = 0usize;
        while inner.base < before.0 && inner.records.pop_front().is_some() {
            inner.base += 1;
            reclaimed += 1;
        }
        if inner.records.is_empty() && inner.base < before.0 {
            inner.base = before.0;
        }
        debug!(
            "undo truncated to {}, {} records reclaimed",
            inner.base, reclaimed
        );
    }

    fn with_record<R>(
        &self,
        location: UndoLocation,
        f: impl FnOnce(&UndoRecord) -> SeqScanResult<R>,
    ) -> SeqScanResult<Option<R>> {
        let inner = self.inner.read();
        if location.0 < inner.base {
            return Ok(None);
        }
        let record = inner
            .records
            .get((location.0 - inner.base) as usize)
            .ok_or_else(|| {
                SeqScanError::Internal(format!("undo location {} not written yet", location.0))
            })?;
        f(record).map(Some)
    }
}

impl UndoAccess for UndoLog {
    fn page_from_undo(
        &self,
        location: UndoLocation,
        key: Option<&Key>,
    ) -> SeqScanResult<Option<UndoPageImage>> {
        self.with_record(location, |record| {
            let UndoRecord::Page(record) = record else {
                return Err(SeqScanError::Corrupt(format!(
                    "undo location {} is not a page image",
                    location.0
                )));
            };
            let target = key.or(record.lokey.as_ref());
            let image = match target {
                Some(target) => record
                    .images
                    .iter()
                    .find(|image| image.cmp_hikey(target).is_lt())
                    .or(record.images.last()),
                None => record.images.first(),
            }
            .ok_or_else(|| {
                SeqScanError::Corrupt(format!("undo location {} holds no image", location.0))
            })?;
            Ok(UndoPageImage {
                image: image.clone(),
                lokey: record.lokey.clone(),
            })
        })
    }

    fn tuple_version(&self, location: UndoLocation) -> SeqScanResult<Option<LeafTuple>> {
        self.with_record(location, |record| match record {
            UndoRecord::Tuple(tuple) => Ok(tuple.clone()),
            UndoRecord::Page(_) => Err(SeqScanError::Corrupt(format!(
                "undo location {} is not a tuple version",
                location.0
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageFlags;

    fn leaf(lo: u64, hi: Option<u64>, csn: u64) -> PageImage {
        let flags = PageFlags {
            leftmost: lo == 0,
            rightmost: hi.is_none(),
        };
        PageImage::new_leaf(flags, csn, hi.map(Key::from_u64), Vec::new())
    }

    #[test]
    fn merged_record_picks_image_by_key() {
        let log = UndoLog::new();
        let loc = log.push_page(PageUndoRecord {
            images: vec![leaf(0, Some(10), 1), leaf(10, None, 2)],
            lokey: None,
        });
        let first = log.page_from_undo(loc, None).unwrap().unwrap();
        assert_eq!(first.image.hikey(), Some(&Key::from_u64(10)));
        let second = log
            .page_from_undo(loc, Some(&Key::from_u64(10)))
            .unwrap()
            .unwrap();
        assert_eq!(second.image.csn(), 2);
    }

    #[test]
    fn record_lokey_selects_starting_image() {
        let log = UndoLog::new();
        let loc = log.push_page(PageUndoRecord {
            images: vec![leaf(0, Some(10), 1), leaf(10, None, 2)],
            lokey: Some(Key::from_u64(12)),
        });
        let got = log.page_from_undo(loc, None).unwrap().unwrap();
        assert_eq!(got.image.csn(), 2);
        assert_eq!(got.lokey, Some(Key::from_u64(12)));
    }

    #[test]
    fn truncated_records_are_gone() {
        let log = UndoLog::new();
        let a = log.push_page(PageUndoRecord {
            images: vec![leaf(0, None, 1)],
            lokey: None,
        });
        let b = log.push_page(PageUndoRecord {
            images: vec![leaf(0, None, 2)],
            lokey: None,
        });
        log.truncate(b);
        assert!(log.page_from_undo(a, None).unwrap().is_none());
        assert!(log.page_from_undo(b, None).unwrap().is_some());
        assert_eq!(log.retained_from(), b);
        assert!(log.tuple_version(b).is_err());
    }

    #[test]
    fn read_page_as_of_rewinds_chain() {
        let log = UndoLog::new();
        let oldest = log.push_page(PageUndoRecord {
            images: vec![leaf(0, None, 2)],
            lokey: None,
        });
        let mut middle = leaf(0, None, 5);
        middle.header.undo = Some(oldest);
        let mid_loc = log.push_page(PageUndoRecord {
            images: vec![middle],
            lokey: None,
        });
        let mut current = leaf(0, None, 9);
        current.header.undo = Some(mid_loc);

        assert_eq!(log.read_page_as_of(current.clone(), 9).unwrap().csn(), 9);
        assert_eq!(log.read_page_as_of(current.clone(), 6).unwrap().csn(), 5);
        assert_eq!(log.read_page_as_of(current.clone(), 2).unwrap().csn(), 2);
        let err = log.read_page_as_of(current, 1).unwrap_err();
        assert!(err.is_snapshot_too_old());
    }
}
