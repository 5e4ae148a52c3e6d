use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use log::trace;

use crate::buffer::{DiskExtent, PageImage};
use crate::error::{SeqScanError, SeqScanResult};

/// Spacing between consecutive extents. Pages are variable length once
/// encoded; the spacing only keeps offsets page-aligned.
pub const EXTENT_SIZE: u64 = 8192;

/// Copy-on-write store of evicted pages. Every write lands in a fresh
/// extent; old extents stay readable until explicitly released so that
/// scans pinned to an older checkpoint can still load them.
#[derive(Debug, Default)]
pub struct DiskStore {
    extents: DashMap<u64, Bytes>,
    next_offset: AtomicU64,
}

impl DiskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_page(&self, image: &PageImage) -> SeqScanResult<DiskExtent> {
        let data = Bytes::from(bincode::serialize(image)?);
        let offset = self.next_offset.fetch_add(EXTENT_SIZE, Ordering::SeqCst);
        trace!("write page extent {} ({} bytes)", offset, data.len());
        self.extents.insert(offset, data);
        Ok(DiskExtent { offset })
    }

    pub fn read_page(&self, extent: DiskExtent) -> SeqScanResult<PageImage> {
        let data = self
            .extents
            .get(&extent.offset)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SeqScanError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no page at extent {}", extent.offset),
                ))
            })?;
        bincode::deserialize(&data).map_err(|e| {
            SeqScanError::Corrupt(format!("extent {} failed to decode: {}", extent.offset, e))
        })
    }

    pub fn release(&self, extent: DiskExtent) {
        self.extents.remove(&extent.offset);
    }

    /// Overwrites the extent with garbage. Used to exercise the corrupt
    /// page path.
    pub fn corrupt(&self, extent: DiskExtent) {
        self.extents
            .insert(extent.offset, Bytes::from_static(&[0xff, 0xff, 0xff]));
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}
