mod common;

use std::collections::BTreeMap;

use btree_seqscan::transaction::Csn;
use btree_seqscan::{MemTree, ParallelScanShared, ScanRegistry, SeqScan, Snapshot};
use bytes::Bytes;
use common::*;
use proptest::prelude::*;

const KEY_SPACE: u64 = 96;

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u8),
    Delete(u64),
    DeleteRange(u64, u64),
    Split(u64),
    Merge(u64),
    Evict(u64),
    ShiftBoundary(u64, u64),
    SplitInternal(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..KEY_SPACE, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0..KEY_SPACE).prop_map(Op::Delete),
        1 => (0..KEY_SPACE, 0u64..12).prop_map(|(lo, len)| Op::DeleteRange(lo, len)),
        2 => (1..KEY_SPACE).prop_map(Op::Split),
        1 => (0..KEY_SPACE).prop_map(Op::Merge),
        2 => (0..KEY_SPACE).prop_map(Op::Evict),
        2 => (1..KEY_SPACE, 1u64..4).prop_map(|(sep, back)| Op::ShiftBoundary(sep, back)),
        1 => (1..KEY_SPACE).prop_map(Op::SplitInternal),
    ]
}

fn put_value(k: u64, v: u8) -> Bytes {
    Bytes::from(format!("{}:{}", k, v))
}

/// Applies `op` to both the tree and the model of its visible rows.
fn apply(tree: &MemTree, model: &mut BTreeMap<u64, Bytes>, op: Op, csn: Csn) {
    match op {
        Op::Put(k, v) => {
            tree.put(key(k), put_value(k, v), csn).unwrap();
            model.insert(k, put_value(k, v));
        }
        Op::Delete(k) => {
            tree.delete(key(k), csn).unwrap();
            model.remove(&k);
        }
        Op::DeleteRange(lo, len) => {
            let hi = lo + len;
            tree.delete_range(&key(lo), &key(hi), csn).unwrap();
            model.retain(|k, _| *k < lo || *k > hi);
        }
        // structural changes are refused where they do not apply
        Op::Split(k) => {
            let _ = tree.split_leaf(&key(k), csn);
        }
        Op::Merge(k) => {
            let _ = tree.merge_leaves(&key(k), csn);
        }
        Op::Evict(k) => {
            let _ = tree.evict(&key(k));
        }
        Op::ShiftBoundary(sep, back) => {
            let _ = tree.shift_boundary(&key(sep), &key(sep - back.min(sep)), csn);
        }
        Op::SplitInternal(at) => {
            let _ = tree.split_internal(&key(at));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every snapshot sees exactly the rows committed at or before it,
    /// whatever mix of in-memory, on-disk and rewound leaves holds them.
    #[test]
    fn scan_matches_reference_model(
        initial in prop::collection::btree_set(0..KEY_SPACE, 0..64),
        ops in prop::collection::vec(arb_op(), 1..40),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..6),
    ) {
        init_logger();
        let tree = tree_with(initial.iter().copied(), 4, 3);
        let mut model: BTreeMap<u64, Bytes> = initial.iter().map(|k| (*k, value(*k))).collect();
        let mut versions: Vec<(Csn, BTreeMap<u64, Bytes>)> = vec![(1, model.clone())];

        for op in ops {
            let csn = tree.commit_csn();
            apply(&tree, &mut model, op, csn);
            versions.push((csn, model.clone()));
        }

        for pick in picks {
            let (csn, expected) = pick.get(&versions);
            let mut scan = open(&tree, Snapshot::as_of(*csn));
            let mut got = BTreeMap::new();
            for (k, v) in drain(&mut scan).unwrap() {
                prop_assert!(got.insert(k, v).is_none(), "key {} returned twice", k);
            }
            prop_assert_eq!(&got, expected);
        }
    }

    /// Scans keep returning their snapshot while the tree is rewritten
    /// between their reads, for a lone scan and for cooperating workers.
    #[test]
    fn scans_ignore_changes_made_while_they_run(
        initial in prop::collection::btree_set(0..KEY_SPACE, 0..64),
        before in prop::collection::vec(arb_op(), 0..20),
        during in prop::collection::vec(arb_op(), 1..40),
        workers in 1usize..4,
        gap in 1usize..4,
    ) {
        init_logger();
        let tree = tree_with(initial.iter().copied(), 4, 3);
        let mut model: BTreeMap<u64, Bytes> = initial.iter().map(|k| (*k, value(*k))).collect();
        for op in before {
            let csn = tree.commit_csn();
            apply(&tree, &mut model, op, csn);
        }
        let snapshot = tree.snapshot();
        let expected = model.clone();

        let registry = ScanRegistry::new();
        let shared = ParallelScanShared::new();
        let mut scans = vec![SeqScan::builder(tree.clone(), snapshot)
            .registry(registry.clone())
            .open()];
        for _ in 0..workers {
            scans.push(
                SeqScan::builder(tree.clone(), snapshot)
                    .parallel(shared.clone())
                    .registry(registry.clone())
                    .open(),
            );
        }

        let mut solo = BTreeMap::new();
        let mut union = BTreeMap::new();
        let mut during = during.into_iter();
        let mut round = 0;
        let mut pulled = true;
        while pulled {
            pulled = false;
            for (i, scan) in scans.iter_mut().enumerate() {
                let Some(tuple) = scan.next().unwrap() else {
                    continue;
                };
                pulled = true;
                let k = tuple.key.as_u64().unwrap();
                let out = if i == 0 { &mut solo } else { &mut union };
                prop_assert!(out.insert(k, tuple.value).is_none(), "key {} returned twice", k);
            }
            round += 1;
            if round % gap == 0 {
                if let Some(op) = during.next() {
                    let csn = tree.commit_csn();
                    apply(&tree, &mut model, op, csn);
                }
            }
        }

        prop_assert_eq!(&solo, &expected);
        prop_assert_eq!(&union, &expected);
        drop(scans);
        prop_assert!(registry.is_empty());
    }
}
