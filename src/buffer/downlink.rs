use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::buffer::{BlockNumber, ChangeCount, CHANGE_COUNT_MASK};

/// Number of the I/O lock guarding an in-flight page load.
pub type IoNum = u32;

/// Location of a page image written out to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskExtent {
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkKind {
    InMemory,
    OnDisk,
    InIo,
}

/// Child pointer stored in an internal page.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Downlink {
    InMemory {
        blkno: BlockNumber,
        change_count: ChangeCount,
    },
    OnDisk(DiskExtent),
    InIo(IoNum),
}

impl Downlink {
    pub fn in_memory(blkno: BlockNumber, change_count: ChangeCount) -> Self {
        Downlink::InMemory {
            blkno,
            change_count: change_count & CHANGE_COUNT_MASK,
        }
    }

    pub fn on_disk(offset: u64) -> Self {
        Downlink::OnDisk(DiskExtent { offset })
    }

    pub fn kind(&self) -> DownlinkKind {
        match self {
            Downlink::InMemory { .. } => DownlinkKind::InMemory,
            Downlink::OnDisk(_) => DownlinkKind::OnDisk,
            Downlink::InIo(_) => DownlinkKind::InIo,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.kind() == DownlinkKind::InMemory
    }

    pub fn is_on_disk(&self) -> bool {
        self.kind() == DownlinkKind::OnDisk
    }

    pub fn is_in_io(&self) -> bool {
        self.kind() == DownlinkKind::InIo
    }

    pub fn blkno(&self) -> Option<BlockNumber> {
        match self {
            Downlink::InMemory { blkno, .. } => Some(*blkno),
            _ => None,
        }
    }

    pub fn change_count(&self) -> Option<ChangeCount> {
        match self {
            Downlink::InMemory { change_count, .. } => Some(*change_count),
            _ => None,
        }
    }

    pub fn extent(&self) -> Option<DiskExtent> {
        match self {
            Downlink::OnDisk(extent) => Some(*extent),
            _ => None,
        }
    }

    pub fn io_num(&self) -> Option<IoNum> {
        match self {
            Downlink::InIo(num) => Some(*num),
            _ => None,
        }
    }
}

impl Debug for Downlink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Downlink::InMemory {
                blkno,
                change_count,
            } => f
                .debug_struct("Downlink")
                .field("blkno", blkno)
                .field("change_count", change_count)
                .finish(),
            Downlink::OnDisk(extent) => f
                .debug_struct("Downlink")
                .field("offset", &extent.offset)
                .finish(),
            Downlink::InIo(num) => f.debug_struct("Downlink").field("io", num).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_routes_each_case() {
        let mem = Downlink::in_memory(7, 3);
        assert_eq!(mem.kind(), DownlinkKind::InMemory);
        assert_eq!(mem.blkno(), Some(7));
        assert_eq!(mem.change_count(), Some(3));
        assert_eq!(mem.extent(), None);

        let disk = Downlink::on_disk(4096);
        assert!(disk.is_on_disk());
        assert_eq!(disk.extent(), Some(DiskExtent { offset: 4096 }));

        let io = Downlink::InIo(5);
        assert!(io.is_in_io());
        assert_eq!(io.io_num(), Some(5));
        assert_eq!(io.blkno(), None);
    }

    #[test]
    fn change_count_is_masked() {
        let mem = Downlink::in_memory(1, CHANGE_COUNT_MASK + 2);
        assert_eq!(mem.change_count(), Some(1));
    }
}
