use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::SeqScanResult;
use crate::scan::walker::{WalkState, WalkStep};
use crate::storage::PageAccess;

#[derive(Debug, Default)]
struct SharedWalk {
    walk: WalkState,
    workers: usize,
    leader_started: bool,
}

/// State shared by the workers of one parallel scan.
///
/// All workers pull downlinks from a single internal-page walk. The lock
/// covers the walk's page slots and item offset; leaf reads, undo walks and
/// disk I/O happen after it is released, and every worker keeps its own
/// disk batch.
#[derive(Debug, Default)]
pub struct ParallelScanShared {
    inner: Mutex<SharedWalk>,
}

impl ParallelScanShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hands out the next worker number. Worker 0 is the leader.
    pub(crate) fn claim_worker(&self) -> usize {
        let mut inner = self.inner.lock();
        let worker = inner.workers;
        inner.workers += 1;
        if worker == 0 {
            inner.leader_started = true;
        }
        debug!("parallel scan worker {} joined", worker);
        worker
    }

    pub fn workers(&self) -> usize {
        self.inner.lock().workers
    }

    pub fn leader_started(&self) -> bool {
        self.inner.lock().leader_started
    }

    /// True once some worker found the tree to be a single leaf.
    pub fn is_single_leaf(&self) -> bool {
        self.inner.lock().walk.is_single_leaf()
    }

    /// Claims the next unclaimed downlink. Each downlink goes to exactly one
    /// worker.
    pub(crate) fn next_step<T>(&self, tree: &T) -> SeqScanResult<WalkStep>
    where
        T: PageAccess + ?Sized,
    {
        self.inner.lock().walk.next_step(tree, true)
    }
}
