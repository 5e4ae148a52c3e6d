//! Sequential scan engine for a B-tree whose leaves may live in memory or on
//! disk, with MVCC reconstruction of leaves newer than the scan's snapshot.

pub mod buffer;
pub mod config;
pub mod error;
pub mod scan;
pub mod storage;
pub mod transaction;

pub use config::{MemTreeConfig, SeqScanConfig};
pub use error::{SeqScanError, SeqScanResult};
pub use scan::{
    global_scan_registry, BlockSampler, DiskDownlinkEntry, KeyRange, LeafHint, NextKey,
    ParallelScanShared, RawTuple, ScanCallbacks, ScanPhase, ScanRegistry, ScanTuple, SeqScan,
    SeqScanBuilder,
};
pub use storage::{MemTree, TreeAccess};
pub use transaction::Snapshot;
