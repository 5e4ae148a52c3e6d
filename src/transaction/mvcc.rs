use crate::buffer::{LeafTuple, XactInfo};
use crate::error::{SeqScanError, SeqScanResult};
use crate::storage::UndoAccess;
use crate::transaction::{Csn, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCsn {
    /// Sees every commit with a CSN not newer than the boundary.
    AsOf(Csn),
    /// Sees the newest version of every tuple, committed or not. Used for
    /// sampling where a consistent snapshot is not required.
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    csn: SnapshotCsn,
    txn_id: Option<TransactionId>,
}

impl Snapshot {
    pub fn as_of(csn: Csn) -> Self {
        Self {
            csn: SnapshotCsn::AsOf(csn),
            txn_id: None,
        }
    }

    pub fn in_progress() -> Self {
        Self {
            csn: SnapshotCsn::InProgress,
            txn_id: None,
        }
    }

    /// Snapshot of a running transaction: its own uncommitted writes are
    /// visible in addition to everything committed up to `csn`.
    pub fn for_transaction(csn: Csn, txn_id: TransactionId) -> Self {
        Self {
            csn: SnapshotCsn::AsOf(csn),
            txn_id: Some(txn_id),
        }
    }

    pub fn csn(&self) -> SnapshotCsn {
        self.csn
    }

    pub fn txn_id(&self) -> Option<TransactionId> {
        self.txn_id
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.csn, SnapshotCsn::AsOf(_))
    }

    /// True when a page or tuple stamped with `csn` is newer than this
    /// snapshot and has to be rewound through undo.
    pub fn is_newer(&self, csn: Csn) -> bool {
        match self.csn {
            SnapshotCsn::AsOf(boundary) => csn > boundary,
            SnapshotCsn::InProgress => false,
        }
    }

    pub fn is_own(&self, xact: XactInfo) -> bool {
        match (xact, self.txn_id) {
            (XactInfo::InProgress(owner), Some(me)) => owner == me,
            _ => false,
        }
    }

    pub fn is_visible(&self, xact: XactInfo) -> bool {
        match self.csn {
            SnapshotCsn::InProgress => true,
            SnapshotCsn::AsOf(boundary) => match xact {
                XactInfo::Committed(csn) => csn <= boundary,
                XactInfo::InProgress(_) => self.is_own(xact),
            },
        }
    }
}

/// Walks the tuple-level version chain starting at `tuple` until a version
/// visible under `snapshot` is found. Returns `None` when no version is
/// visible or the visible version is a tombstone.
pub fn resolve_visible_version<U>(
    undo: &U,
    tuple: &LeafTuple,
    snapshot: &Snapshot,
) -> SeqScanResult<Option<LeafTuple>>
where
    U: UndoAccess + ?Sized,
{
    if snapshot.is_visible(tuple.header.xact) {
        return Ok(live_or_none(tuple.clone()));
    }
    let mut next = tuple.header.prev_version;
    while let Some(location) = next {
        let Some(version) = undo.tuple_version(location)? else {
            return Err(SeqScanError::SnapshotTooOld);
        };
        if snapshot.is_visible(version.header.xact) {
            return Ok(live_or_none(version));
        }
        next = version.header.prev_version;
    }
    Ok(None)
}

fn live_or_none(tuple: LeafTuple) -> Option<LeafTuple> {
    if tuple.header.deleted {
        None
    } else {
        Some(tuple)
    }
}
