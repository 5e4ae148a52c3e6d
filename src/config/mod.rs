use std::time::Duration;

use derive_with::With;

#[derive(Debug, Clone, Copy, With)]
pub struct SeqScanConfig {
    /// Initial capacity of the on-disk downlink batch. The batch doubles on
    /// overflow.
    pub initial_disk_downlinks: usize,
    /// Hard cap on the number of batched on-disk downlinks. Growing past it
    /// fails the scan with `ResourceExhausted`.
    pub max_disk_downlinks: usize,
}

impl Default for SeqScanConfig {
    fn default() -> Self {
        SeqScanConfig {
            initial_disk_downlinks: 16,
            max_disk_downlinks: 1 << 24,
        }
    }
}

#[derive(Debug, Clone, Copy, With)]
pub struct MemTreeConfig {
    /// Tuples per leaf produced by bulk load.
    pub leaf_capacity: usize,
    /// Downlinks per level-1 internal page produced by bulk load.
    pub internal_fanout: usize,
    /// Bound on a single wait for an in-flight page load. The downlink is
    /// re-resolved from scratch after the wait either way.
    pub io_wait_timeout: Duration,
}

impl Default for MemTreeConfig {
    fn default() -> Self {
        MemTreeConfig {
            leaf_capacity: 32,
            internal_fanout: 16,
            io_wait_timeout: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let cfg = SeqScanConfig::default()
            .with_initial_disk_downlinks(2usize)
            .with_max_disk_downlinks(8usize);
        assert_eq!(cfg.initial_disk_downlinks, 2);
        assert_eq!(cfg.max_disk_downlinks, 8);

        let tree = MemTreeConfig::default().with_leaf_capacity(4usize);
        assert_eq!(tree.leaf_capacity, 4);
        assert_eq!(tree.internal_fanout, 16);
    }
}
