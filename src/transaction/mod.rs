mod checkpoint;
mod mvcc;

pub use checkpoint::{CheckpointState, RetentionToken};
pub use mvcc::{resolve_visible_version, Snapshot, SnapshotCsn};

/// Commit sequence number. Assigned monotonically at commit time.
pub type Csn = u64;
pub type TransactionId = u64;

/// Versions stamped with the frozen CSN are visible to every snapshot.
pub const CSN_FROZEN: Csn = 0;
/// First CSN handed out to a real commit.
pub const CSN_FIRST_NORMAL: Csn = 1;
