#![allow(dead_code)]

use std::sync::Arc;

use btree_seqscan::buffer::Key;
use btree_seqscan::{MemTree, MemTreeConfig, ScanRegistry, SeqScan, SeqScanResult, Snapshot};
use bytes::Bytes;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(k: u64) -> Key {
    Key::from_u64(k)
}

pub fn value(k: u64) -> Bytes {
    Bytes::from(format!("v{}", k))
}

/// Tree holding `keys`, `leaf` tuples per leaf and `fanout` leaves per
/// level-1 page.
pub fn tree_with<I>(keys: I, leaf: usize, fanout: usize) -> Arc<MemTree>
where
    I: IntoIterator<Item = u64>,
{
    let config = MemTreeConfig::default()
        .with_leaf_capacity(leaf)
        .with_internal_fanout(fanout);
    Arc::new(MemTree::bulk_load(
        config,
        keys.into_iter().map(|k| (key(k), value(k))),
    ))
}

pub fn open(tree: &Arc<MemTree>, snapshot: Snapshot) -> SeqScan {
    SeqScan::builder(tree.clone(), snapshot)
        .registry(ScanRegistry::new())
        .open()
}

pub fn drain(scan: &mut SeqScan) -> SeqScanResult<Vec<(u64, Bytes)>> {
    let mut out = Vec::new();
    while let Some(tuple) = scan.next()? {
        let k = tuple.key.as_u64().expect("numeric key");
        out.push((k, tuple.value));
    }
    Ok(out)
}

pub fn drain_keys(scan: &mut SeqScan) -> Vec<u64> {
    drain(scan)
        .expect("scan failed")
        .into_iter()
        .map(|(k, _)| k)
        .collect()
}

pub fn sorted(mut keys: Vec<u64>) -> Vec<u64> {
    keys.sort_unstable();
    keys
}
