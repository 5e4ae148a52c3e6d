use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::buffer::Downlink;
use crate::storage::UndoLocation;
use crate::transaction::{Csn, TransactionId};

pub type BlockNumber = u32;
pub type ChangeCount = u32;

pub const INVALID_BLKNO: BlockNumber = u32::MAX;
pub const INVALID_CHANGE_COUNT: ChangeCount = u32::MAX;
/// Change counts wrap inside 30 bits so a downlink can always carry one.
pub const CHANGE_COUNT_MASK: ChangeCount = (1 << 30) - 1;
pub const PAGE_LEVEL_LEAF: u8 = 0;

/// Key bytes compared lexicographically.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Big-endian so that byte order matches numeric order.
    pub fn from_u64(v: u64) -> Self {
        Self(v.to_be_bytes().to_vec())
    }

    pub fn as_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(v) => write!(f, "Key({})", v),
            None => write!(f, "Key({:02x?})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XactInfo {
    Committed(Csn),
    InProgress(TransactionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleHeader {
    pub xact: XactInfo,
    /// Tombstone left by a delete until the page is compacted.
    pub deleted: bool,
    /// Previous version of this tuple in the undo log.
    pub prev_version: Option<UndoLocation>,
}

impl TupleHeader {
    pub fn committed(csn: Csn) -> Self {
        Self {
            xact: XactInfo::Committed(csn),
            deleted: false,
            prev_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct LeafTuple {
    pub key: Key,
    pub header: TupleHeader,
    pub value: Bytes,
}

/// Downlink of an internal page. The key of the first item on a page is not
/// meaningful: the first child is bounded by the page's own low key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct InternalItem {
    pub key: Key,
    pub downlink: Downlink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags {
    pub leftmost: bool,
    pub rightmost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    pub level: u8,
    pub flags: PageFlags,
    /// Latest commit that changed the page structure.
    pub csn: Csn,
    /// Most recent page-level undo record.
    pub undo: Option<UndoLocation>,
    /// Exclusive upper bound. `None` on the rightmost page of a level.
    pub hikey: Option<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageBody {
    Internal(Vec<InternalItem>),
    Leaf(Vec<LeafTuple>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub header: PageHeader,
    pub body: PageBody,
}

impl PageImage {
    pub fn new_leaf(
        flags: PageFlags,
        csn: Csn,
        hikey: Option<Key>,
        tuples: Vec<LeafTuple>,
    ) -> Self {
        Self {
            header: PageHeader {
                level: PAGE_LEVEL_LEAF,
                flags,
                csn,
                undo: None,
                hikey,
            },
            body: PageBody::Leaf(tuples),
        }
    }

    pub fn new_internal(
        level: u8,
        flags: PageFlags,
        csn: Csn,
        hikey: Option<Key>,
        items: Vec<InternalItem>,
    ) -> Self {
        Self {
            header: PageHeader {
                level,
                flags,
                csn,
                undo: None,
                hikey,
            },
            body: PageBody::Internal(items),
        }
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn is_leaf(&self) -> bool {
        self.header.level == PAGE_LEVEL_LEAF
    }

    pub fn is_leftmost(&self) -> bool {
        self.header.flags.leftmost
    }

    pub fn is_rightmost(&self) -> bool {
        self.header.flags.rightmost
    }

    pub fn csn(&self) -> Csn {
        self.header.csn
    }

    pub fn undo(&self) -> Option<UndoLocation> {
        self.header.undo
    }

    /// High key, or `None` for the rightmost page.
    pub fn hikey(&self) -> Option<&Key> {
        if self.is_rightmost() {
            None
        } else {
            self.header.hikey.as_ref()
        }
    }

    pub fn len(&self) -> usize {
        match &self.body {
            PageBody::Internal(items) => items.len(),
            PageBody::Leaf(tuples) => tuples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tuples(&self) -> &[LeafTuple] {
        match &self.body {
            PageBody::Leaf(tuples) => tuples,
            PageBody::Internal(_) => &[],
        }
    }

    pub fn tuples_mut(&mut self) -> Option<&mut Vec<LeafTuple>> {
        match &mut self.body {
            PageBody::Leaf(tuples) => Some(tuples),
            PageBody::Internal(_) => None,
        }
    }

    pub fn items(&self) -> &[InternalItem] {
        match &self.body {
            PageBody::Internal(items) => items,
            PageBody::Leaf(_) => &[],
        }
    }

    pub fn items_mut(&mut self) -> Option<&mut Vec<InternalItem>> {
        match &mut self.body {
            PageBody::Internal(items) => Some(items),
            PageBody::Leaf(_) => None,
        }
    }

    /// Position of the first leaf tuple whose key is not less than `key`.
    pub fn leaf_lower_bound(&self, key: &Key) -> usize {
        self.tuples().partition_point(|t| t.key < *key)
    }

    /// Index of the child whose key range contains `key`.
    pub fn child_index(&self, key: &Key) -> usize {
        let items = self.items();
        if items.len() <= 1 {
            return 0;
        }
        items[1..].partition_point(|item| item.key <= *key)
    }

    /// Compares `key` against the exclusive upper bound of this page.
    pub fn cmp_hikey(&self, key: &Key) -> Ordering {
        match self.hikey() {
            Some(hikey) => key.cmp(hikey),
            None => Ordering::Less,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[u64], hikey: Option<u64>) -> PageImage {
        let tuples = keys
            .iter()
            .map(|k| LeafTuple::new(Key::from_u64(*k), TupleHeader::committed(1), Bytes::new()))
            .collect();
        let flags = PageFlags {
            leftmost: false,
            rightmost: hikey.is_none(),
        };
        PageImage::new_leaf(flags, 1, hikey.map(Key::from_u64), tuples)
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(Key::from_u64(2) < Key::from_u64(256));
        assert_eq!(Key::from_u64(99).as_u64(), Some(99));
        assert_eq!(Key::new(vec![1u8]).as_u64(), None);
    }

    #[test]
    fn leaf_lower_bound_finds_first_not_less() {
        let page = leaf(&[10, 20, 30], Some(40));
        assert_eq!(page.leaf_lower_bound(&Key::from_u64(5)), 0);
        assert_eq!(page.leaf_lower_bound(&Key::from_u64(20)), 1);
        assert_eq!(page.leaf_lower_bound(&Key::from_u64(21)), 2);
        assert_eq!(page.leaf_lower_bound(&Key::from_u64(31)), 3);
    }

    #[test]
    fn child_index_respects_separators() {
        let items = [0u64, 10, 20]
            .iter()
            .enumerate()
            .map(|(i, k)| InternalItem::new(Key::from_u64(*k), Downlink::InIo(i as u32)))
            .collect();
        let hikey = Some(Key::from_u64(30));
        let page = PageImage::new_internal(1, PageFlags::default(), 1, hikey, items);
        assert_eq!(page.child_index(&Key::from_u64(3)), 0);
        assert_eq!(page.child_index(&Key::from_u64(10)), 1);
        assert_eq!(page.child_index(&Key::from_u64(19)), 1);
        assert_eq!(page.child_index(&Key::from_u64(25)), 2);
    }

    #[test]
    fn rightmost_page_has_open_hikey() {
        let page = leaf(&[1], None);
        assert_eq!(page.hikey(), None);
        assert_eq!(page.cmp_hikey(&Key::from_u64(u64::MAX)), Ordering::Less);
        let page = leaf(&[1], Some(9));
        assert_eq!(page.cmp_hikey(&Key::from_u64(9)), Ordering::Equal);
    }
}
