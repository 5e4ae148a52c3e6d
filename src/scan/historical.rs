use std::cmp::Ordering;

use log::trace;

use crate::buffer::{Key, PageImage};
use crate::error::{SeqScanError, SeqScanResult};
use crate::storage::UndoAccess;
use crate::transaction::Snapshot;

/// Historical image of a live leaf together with the key it has to be read
/// from.
#[derive(Debug)]
pub(crate) struct HistoricalPage {
    pub image: PageImage,
    pub lokey: Option<Key>,
}

/// Rewinds `live` through its undo chain until the page is not newer than
/// `snapshot`. Returns `None` when the live page is already old enough or
/// the snapshot does not read history at all.
///
/// The first undo record hands out the low key of the live page; later
/// steps look that key up so that records spanning several former pages
/// yield the one the live page starts in.
pub(crate) fn load_first_historical_page<U>(
    undo: &U,
    live: &PageImage,
    snapshot: &Snapshot,
) -> SeqScanResult<Option<HistoricalPage>>
where
    U: UndoAccess + ?Sized,
{
    if !snapshot.is_normal() {
        return Ok(None);
    }
    let mut csn = live.csn();
    let mut location = live.undo();
    let mut lokey: Option<Key> = None;
    let mut image = None;
    while snapshot.is_newer(csn) {
        let at = location.ok_or(SeqScanError::SnapshotTooOld)?;
        let step = undo
            .page_from_undo(at, lokey.as_ref())?
            .ok_or(SeqScanError::SnapshotTooOld)?;
        if lokey.is_none() {
            lokey = step.lokey;
        }
        csn = step.image.csn();
        location = step.image.undo();
        image = Some(step.image);
    }
    if let Some(image) = &image {
        trace!(
            "historical image at csn {} for live page at csn {}",
            image.csn(),
            live.csn()
        );
    }
    Ok(image.map(|image| HistoricalPage { image, lokey }))
}

/// Loads the historical image following `prev` within the span of `live`.
/// Returns `None` when the undo chain does not lead past `prev`.
pub(crate) fn load_next_historical_page<U>(
    undo: &U,
    live: &PageImage,
    prev: &PageImage,
    snapshot: &Snapshot,
) -> SeqScanResult<Option<PageImage>>
where
    U: UndoAccess + ?Sized,
{
    let Some(prev_hikey) = prev.hikey() else {
        return Ok(None);
    };
    let mut csn = live.csn();
    let mut location = live.undo();
    let mut image = None;
    while snapshot.is_newer(csn) {
        let at = location.ok_or(SeqScanError::SnapshotTooOld)?;
        let step = undo
            .page_from_undo(at, Some(prev_hikey))?
            .ok_or(SeqScanError::SnapshotTooOld)?;
        csn = step.image.csn();
        location = step.image.undo();
        image = Some(step.image);
    }
    Ok(image.filter(|next| next.cmp_hikey(prev_hikey) == Ordering::Less))
}
