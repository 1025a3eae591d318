#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;

use cellstore::primitives::pager::Synchronous;
use cellstore::storage::{BTreeOptions, MultiValueTree, SingleValueTree, Storage, StorageOptions};
use cellstore::types::{Result, Rid};
use proptest::prelude::*;
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions {
        cache_pages: 512,
        synchronous: Synchronous::Normal,
        auto_checkpoint_ms: None,
        ..StorageOptions::default()
    }
}

fn tree_options() -> BTreeOptions {
    BTreeOptions {
        prefetch_entries: 5,
        ..BTreeOptions::default()
    }
}

#[derive(Clone, Debug)]
enum Op {
    Put(u16, i64),
    Remove(u16, i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..400, 0i64..4).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (0u16..400, 0i64..4).prop_map(|(k, v)| Op::Remove(k, v)),
    ]
}

fn key(k: u16) -> String {
    format!("key-{k:04}-{}", "x".repeat(usize::from(k % 40)))
}

fn model_range(
    model: &BTreeMap<String, Vec<i64>>,
    lower: Bound<&String>,
    upper: Bound<&String>,
) -> Vec<(String, Rid)> {
    model
        .range::<String, _>((lower, upper))
        .flat_map(|(k, values)| values.iter().map(move |v| (k.clone(), Rid::new(9, *v))))
        .collect()
}

fn check_multi(
    ops: Vec<Op>,
    commit_every: usize,
    bounds: (u16, u16),
) -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "props", options())?;
    let mut model: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    let mut staged = model.clone();
    let tree = {
        let mut op = storage.begin_atomic_operation()?;
        let tree = MultiValueTree::<String>::create(&mut op, "multi", tree_options())?;
        op.commit()?;
        tree
    };

    for (round, chunk) in ops.chunks(commit_every.max(1)).enumerate() {
        let mut op = storage.begin_atomic_operation()?;
        for step in chunk {
            match *step {
                Op::Put(k, v) => {
                    let values = staged.entry(key(k)).or_default();
                    let fresh = !values.contains(&v);
                    if fresh {
                        values.push(v);
                    }
                    assert_eq!(tree.put(&mut op, &key(k), Rid::new(9, v))?, fresh);
                }
                Op::Remove(k, v) => {
                    let present = staged.get(&key(k)).is_some_and(|values| values.contains(&v));
                    if present {
                        if let Some(values) = staged.get_mut(&key(k)) {
                            values.retain(|x| *x != v);
                            if values.is_empty() {
                                staged.remove(&key(k));
                            }
                        }
                    }
                    assert_eq!(tree.remove(&mut op, &key(k), Rid::new(9, v))?, present);
                }
            }
        }
        if round % 3 == 2 {
            op.rollback();
            staged = model.clone();
        } else {
            op.commit()?;
            model = staged.clone();
        }
    }

    let expected_len: usize = model.values().map(Vec::len).sum();
    assert_eq!(tree.size()? as usize, expected_len);
    assert_eq!(tree.check()?.entries as usize, expected_len);

    let (a, b) = (key(bounds.0.min(bounds.1)), key(bounds.0.max(bounds.1)));
    let forward: Vec<(String, Rid)> = tree
        .iterate_entries_between(&a, true, &b, false, true)?
        .collect::<Result<_>>()?;
    assert_eq!(forward, model_range(&model, Bound::Included(&a), Bound::Excluded(&b)));
    let mut backward: Vec<(String, Rid)> = tree
        .iterate_entries_between(&a, true, &b, false, false)?
        .collect::<Result<_>>()?;
    backward.reverse();
    assert_eq!(backward, forward);

    let above: Vec<(String, Rid)> = tree
        .iterate_entries_major(&a, false, true)?
        .collect::<Result<_>>()?;
    assert_eq!(above, model_range(&model, Bound::Excluded(&a), Bound::Unbounded));
    let below: Vec<(String, Rid)> = tree
        .iterate_entries_minor(&b, true, false)?
        .collect::<Result<_>>()?;
    let mut expected_below = model_range(&model, Bound::Unbounded, Bound::Included(&b));
    expected_below.reverse();
    assert_eq!(below, expected_below);

    let keys: Vec<String> = tree.key_stream().collect::<Result<_>>()?;
    assert_eq!(keys, model.keys().cloned().collect::<Vec<_>>());
    drop(tree);
    storage.close()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn multi_value_tree_matches_model(
        ops in prop::collection::vec(op_strategy(), 1..600),
        commit_every in 1usize..80,
        bounds in (0u16..400, 0u16..400),
    ) {
        check_multi(ops, commit_every, bounds).map_err(|err| TestCaseError::fail(err.to_string()))?;
    }
}

#[test]
fn single_value_tree_survives_grow_and_shrink_cycles() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "cycles", options())?;
    let tree = {
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<i64>::create(&mut op, "cycles", tree_options())?;
        op.commit()?;
        tree
    };
    let mut pages_after_first_cycle = None;
    for cycle in 0..3 {
        let mut op = storage.begin_atomic_operation()?;
        for n in 0..3_000i64 {
            tree.put(&mut op, &(n * 7 % 3_001), Rid::new(cycle, n))?;
        }
        op.commit()?;
        assert_eq!(tree.size()?, 3_000);

        let mut op = storage.begin_atomic_operation()?;
        for n in 0..3_000i64 {
            assert!(tree.remove(&mut op, &(n * 7 % 3_001))?.is_some());
        }
        op.commit()?;
        let shape = tree.check()?;
        assert_eq!(shape.entries, 0);
        assert_eq!(shape.depth, 1);
        match pages_after_first_cycle {
            None => pages_after_first_cycle = Some(shape.file_pages),
            Some(pages) => assert_eq!(shape.file_pages, pages, "freed buckets are reused"),
        }
    }
    assert_eq!(tree.first_key()?, None);
    drop(tree);
    storage.close()
}
