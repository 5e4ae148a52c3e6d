mod arena;
mod downlink;
mod page;

pub use arena::PageArena;
pub use downlink::{DiskExtent, Downlink, DownlinkKind, IoNum};
pub use page::{
    BlockNumber, ChangeCount, InternalItem, Key, LeafTuple, PageBody, PageFlags, PageHeader,
    PageImage, TupleHeader, XactInfo, CHANGE_COUNT_MASK, INVALID_BLKNO, INVALID_CHANGE_COUNT,
    PAGE_LEVEL_LEAF,
};
