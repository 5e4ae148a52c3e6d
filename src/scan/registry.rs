use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use log::{debug, warn};

use crate::storage::TreeAccess;
use crate::transaction::RetentionToken;

struct RegisteredScan {
    tree: Arc<dyn TreeAccess>,
    token: RetentionToken,
}

/// Registry of open scans and the retention claims they hold.
///
/// Closing a scan unregisters it. [`ScanRegistry::cleanup_all`] is the
/// shutdown sweep: it releases the claims of every scan still registered,
/// whether or not its owner ever gets to close it.
#[derive(Default)]
pub struct ScanRegistry {
    scans: DashMap<u64, RegisteredScan>,
    next_id: AtomicU64,
}

impl ScanRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims retention on `tree`'s current checkpoint generation.
    pub fn register(&self, tree: Arc<dyn TreeAccess>) -> (u64, RetentionToken) {
        let token = tree.checkpoints().register_scan();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.scans.insert(id, RegisteredScan { tree, token });
        debug!(
            "scan {} registered against generation {}",
            id,
            token.generation()
        );
        (id, token)
    }

    /// Releases the claim of scan `id`. False when it was already released.
    pub fn unregister(&self, id: u64) -> bool {
        match self.scans.remove(&id) {
            Some((_, scan)) => {
                scan.tree.checkpoints().release(scan.token);
                debug!("scan {} unregistered", id);
                true
            }
            None => false,
        }
    }

    /// Releases every outstanding claim. Returns how many were released.
    pub fn cleanup_all(&self) -> usize {
        let ids: Vec<u64> = self.scans.iter().map(|entry| *entry.key()).collect();
        let released = ids.into_iter().filter(|id| self.unregister(*id)).count();
        if released > 0 {
            warn!("released retention of {} scans left open", released);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }
}

impl fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRegistry")
            .field("scans", &self.scans.len())
            .finish()
    }
}

static SCAN_REGISTRY: OnceLock<Arc<ScanRegistry>> = OnceLock::new();

/// Process-wide registry used by scans that are not given one explicitly.
pub fn global_scan_registry() -> Arc<ScanRegistry> {
    SCAN_REGISTRY.get_or_init(ScanRegistry::new).clone()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::buffer::Key;
    use crate::config::MemTreeConfig;
    use crate::storage::MemTree;

    fn tree() -> Arc<MemTree> {
        Arc::new(MemTree::bulk_load(
            MemTreeConfig::default(),
            (0..4u64).map(|k| (Key::from_u64(k), Bytes::new())),
        ))
    }

    #[test]
    fn unregister_is_idempotent() {
        let tree = tree();
        let registry = ScanRegistry::new();
        let (id, token) = registry.register(tree.clone());
        assert_eq!(tree.checkpoints().live_scans(token.generation()), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(tree.checkpoints().live_scans(token.generation()), 0);
    }

    #[test]
    fn sweep_releases_everything() {
        let tree = tree();
        let registry = ScanRegistry::new();
        for _ in 0..3 {
            registry.register(tree.clone());
        }
        let generation = tree.checkpoints().current_generation().0;
        assert!(!tree.checkpoints().can_reclaim(generation));
        assert_eq!(registry.cleanup_all(), 3);
        assert!(registry.is_empty());
        assert!(tree.checkpoints().can_reclaim(generation));
        assert_eq!(registry.cleanup_all(), 0);
    }
}
