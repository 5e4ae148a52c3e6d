use derive_new::new;
use log::debug;

use crate::buffer::DiskExtent;
use crate::error::{SeqScanError, SeqScanResult};
use crate::transaction::Csn;

/// On-disk downlink found during the in-memory phase, with the CSN the
/// internal page it came from was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct DiskDownlinkEntry {
    pub extent: DiskExtent,
    pub csn: Csn,
}

/// Downlinks whose leaves are read only after the internal-page walk is
/// done, in ascending extent order.
#[derive(Debug)]
pub(crate) struct DiskBatch {
    entries: Vec<DiskDownlinkEntry>,
    capacity: usize,
    max: usize,
    cursor: usize,
}

impl DiskBatch {
    pub(crate) fn new(initial: usize, max: usize) -> Self {
        let capacity = initial.max(1).min(max.max(1));
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            max: max.max(1),
            cursor: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: DiskDownlinkEntry) -> SeqScanResult<()> {
        if self.entries.len() >= self.capacity {
            self.grow()?;
        }
        self.entries.push(entry);
        Ok(())
    }

    fn grow(&mut self) -> SeqScanResult<()> {
        if self.capacity >= self.max {
            return Err(SeqScanError::ResourceExhausted(format!(
                "disk downlink batch is limited to {} entries",
                self.max
            )));
        }
        let capacity = self.capacity.saturating_mul(2).min(self.max);
        self.entries
            .try_reserve_exact(capacity - self.entries.len())
            .map_err(|e| SeqScanError::ResourceExhausted(e.to_string()))?;
        debug!("disk downlink batch grew {} -> {}", self.capacity, capacity);
        self.capacity = capacity;
        Ok(())
    }

    /// Orders the batch by physical location. The sort is stable, so equal
    /// extents keep discovery order.
    pub(crate) fn sort(&mut self) {
        self.entries.sort_by_key(|entry| entry.extent);
        self.cursor = 0;
    }

    pub(crate) fn next(&mut self) -> Option<DiskDownlinkEntry> {
        let entry = self.entries.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64) -> DiskDownlinkEntry {
        DiskDownlinkEntry::new(DiskExtent { offset }, 1)
    }

    #[test]
    fn replays_in_extent_order() {
        let mut batch = DiskBatch::new(16, 1024);
        for offset in [40, 8, 24, 0, 16] {
            batch.push(entry(offset)).unwrap();
        }
        batch.sort();
        let offsets: Vec<u64> = std::iter::from_fn(|| batch.next())
            .map(|e| e.extent.offset)
            .collect();
        assert_eq!(offsets, vec![0, 8, 16, 24, 40]);
        assert!(batch.next().is_none());
    }

    #[test]
    fn doubles_until_the_cap() {
        let mut batch = DiskBatch::new(2, 6);
        for offset in 0..6 {
            batch.push(entry(offset)).unwrap();
        }
        assert_eq!(batch.capacity(), 6);
        assert_eq!(batch.len(), 6);
        let err = batch.push(entry(6)).unwrap_err();
        assert!(matches!(err, SeqScanError::ResourceExhausted(_)));
    }
}
