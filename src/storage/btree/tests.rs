use super::*;
use crate::primitives::dwl::NoopDoubleWriteLog;
use crate::primitives::io::StdFileOpener;
use crate::primitives::pager::{CacheConfig, FileRegistry, PageCache, Synchronous};
use crate::storage::atomic::AtomicOperationsManager;
use crate::storage::options::BTreeOptions;
use crate::types::page::{set_kind, PageKind};
use crate::types::{PageKey, Result, Rid, StoreError};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn manager(dir: &Path) -> Result<AtomicOperationsManager> {
    let registry = Arc::new(FileRegistry::open(dir, 4096, Arc::new(StdFileOpener))?);
    let cache = PageCache::new(
        CacheConfig {
            page_size: 4096,
            capacity: 64,
            verify_checksums: true,
            flush_batch_pages: 64,
            flush_retries: 0,
            flush_retry_backoff: Duration::from_millis(1),
            synchronous: Synchronous::Normal,
        },
        registry,
        Arc::new(NoopDoubleWriteLog),
    )?;
    Ok(AtomicOperationsManager::new(Arc::new(cache)))
}

fn wide_key(n: u32) -> Vec<u8> {
    let mut key = format!("{n:06}").into_bytes();
    key.resize(64, b'.');
    key
}

fn rid(n: i64) -> Rid {
    Rid::new(7, n)
}

fn collect<K: KeySerializer>(stream: EntryStream<'_, K>) -> Result<Vec<(K, Rid)>> {
    stream.collect()
}

fn small_prefetch() -> BTreeOptions {
    BTreeOptions {
        prefetch_entries: 7,
        ..BTreeOptions::default()
    }
}

#[test]
fn put_commit_get_remove_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<String>::create(&mut op, "people", BTreeOptions::default())?;
    tree.put(&mut op, &"k1".to_owned(), Rid::new(10, 1))?;
    op.commit()?;

    let reopened = SingleValueTree::<String>::load(&ops, "people", BTreeOptions::default())?;
    assert_eq!(reopened.get(&"k1".to_owned())?, Some(Rid::new(10, 1)));
    assert_eq!(reopened.size()?, 1);

    let mut op = ops.start_atomic_operation()?;
    assert_eq!(reopened.remove(&mut op, &"k1".to_owned())?, Some(Rid::new(10, 1)));
    op.commit()?;
    assert_eq!(tree.get(&"k1".to_owned())?, None);
    assert_eq!(tree.size()?, 0);
    Ok(())
}

#[test]
fn uncommitted_writes_are_private_to_the_operation() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut op, "private", BTreeOptions::default())?;
    op.commit()?;

    let mut op = ops.start_atomic_operation()?;
    tree.put(&mut op, &5, rid(5))?;
    assert_eq!(tree.get_in(&op, &5)?, Some(rid(5)));
    assert_eq!(tree.size_in(&op)?, 1);
    assert_eq!(tree.get(&5)?, None);
    op.rollback();
    assert_eq!(tree.get(&5)?, None);
    assert_eq!(tree.size()?, 0);
    Ok(())
}

#[test]
fn validated_put_rejection_leaves_tree_unchanged() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<i64>::create(&mut op, "unique", BTreeOptions::default())?;
    tree.put(&mut op, &-3, rid(1))?;
    op.commit()?;

    let unique = |old: Option<Rid>, _: Rid| match old {
        Some(_) => Validation::Ignore,
        None => Validation::Accept,
    };
    let mut op = ops.start_atomic_operation()?;
    assert_eq!(tree.validated_put(&mut op, &-3, rid(2), unique)?, PutOutcome::Rejected);
    assert_eq!(op.touched_pages(), 0);
    assert_eq!(tree.validated_put(&mut op, &4, rid(3), unique)?, PutOutcome::Inserted);
    let outcome = tree.validated_put(&mut op, &4, rid(9), |old, new| {
        assert_eq!((old, new), (Some(rid(3)), rid(9)));
        Validation::Replace(rid(10))
    })?;
    assert_eq!(outcome, PutOutcome::Updated);
    op.commit()?;

    assert_eq!(tree.get(&-3)?, Some(rid(1)));
    assert_eq!(tree.get(&4)?, Some(rid(10)));
    assert_eq!(tree.size()?, 2);
    assert_eq!(tree.stats().in_place_updates, 1);
    Ok(())
}

#[test]
fn randomized_ops_match_btreemap() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<Vec<u8>>::create(&mut op, "random", small_prefetch())?;
    op.commit()?;

    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_cafe);
    let mut model: BTreeMap<Vec<u8>, Rid> = BTreeMap::new();
    for round in 0..30 {
        let mut op = ops.start_atomic_operation()?;
        for _ in 0..120 {
            let key = wide_key(rng.gen_range(0..800));
            if rng.gen_bool(0.65) {
                let value = rid(rng.gen_range(0..1_000_000));
                tree.put(&mut op, &key, value)?;
                model.insert(key, value);
            } else {
                assert_eq!(tree.remove(&mut op, &key)?, model.remove(&key));
            }
        }
        op.commit()?;
        let shape = tree.check()?;
        assert_eq!(shape.entries, model.len() as u64, "round {round}");
    }

    let expected: Vec<(Vec<u8>, Rid)> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
    let ascending = collect(tree.iterate_entries_major(&wide_key(0), true, true)?)?;
    assert_eq!(ascending, expected);
    let mut descending = collect(tree.iterate_entries_major(&wide_key(0), true, false)?)?;
    descending.reverse();
    assert_eq!(descending, expected);
    assert!(tree.check()?.depth >= 2);
    assert!(tree.stats().leaf_splits > 0);

    let mut op = ops.start_atomic_operation()?;
    for key in model.keys() {
        assert!(tree.remove(&mut op, key)?.is_some());
    }
    op.commit()?;
    let shape = tree.check()?;
    assert_eq!((shape.entries, shape.depth), (0, 1));
    assert_eq!((shape.leaf_buckets, shape.internal_buckets), (1, 0));
    assert_eq!(shape.free_buckets + 2, shape.file_pages);
    assert!(tree.stats().merges > 0);
    assert!(tree.stats().root_collapses > 0);
    Ok(())
}

#[test]
fn freed_buckets_are_reused_before_the_file_grows() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<Vec<u8>>::create(&mut op, "reuse", BTreeOptions::default())?;
    for n in 0..1_000 {
        tree.put(&mut op, &wide_key(n), rid(n.into()))?;
    }
    op.commit()?;
    let grown = tree.check()?.file_pages;

    let mut op = ops.start_atomic_operation()?;
    for n in 0..1_000 {
        tree.remove(&mut op, &wide_key(n))?;
    }
    op.commit()?;
    assert!(tree.check()?.free_buckets > 0);

    let mut op = ops.start_atomic_operation()?;
    for n in 0..500 {
        tree.put(&mut op, &wide_key(n), rid(n.into()))?;
    }
    op.commit()?;
    let shape = tree.check()?;
    assert_eq!(shape.file_pages, grown);
    assert_eq!(shape.entries, 500);
    Ok(())
}

#[test]
fn range_bounds_and_directions() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut op, "ranges", small_prefetch())?;
    for n in (0..400u64).step_by(2) {
        tree.put(&mut op, &n, rid(n as i64))?;
    }
    op.commit()?;

    let keys = |stream: EntryStream<'_, u64>| -> Result<Vec<u64>> {
        Ok(collect(stream)?.into_iter().map(|(k, _)| k).collect())
    };
    assert_eq!(keys(tree.iterate_entries_minor(&6, true, true)?)?, vec![0, 2, 4, 6]);
    assert_eq!(keys(tree.iterate_entries_minor(&6, false, false)?)?, vec![4, 2, 0]);
    assert_eq!(keys(tree.iterate_entries_major(&393, false, true)?)?, vec![394, 396, 398]);
    assert_eq!(keys(tree.iterate_entries_major(&394, true, false)?)?, vec![398, 396, 394]);
    let between = keys(tree.iterate_entries_between(&100, false, &200, true, true)?)?;
    assert_eq!(between.first(), Some(&102));
    assert_eq!(between.last(), Some(&200));
    assert_eq!(between.len(), 50);
    let mut reversed = keys(tree.iterate_entries_between(&100, false, &200, true, false)?)?;
    reversed.reverse();
    assert_eq!(reversed, between);
    assert!(keys(tree.iterate_entries_between(&300, true, &100, true, true)?)?.is_empty());

    assert_eq!(tree.first_key()?, Some(0));
    assert_eq!(tree.last_key()?, Some(398));
    let streamed: Vec<u64> = tree.key_stream().collect::<Result<_>>()?;
    assert_eq!(streamed, (0..400).step_by(2).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn multi_value_tree_keeps_set_semantics_and_insertion_order() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = MultiValueTree::<String>::create(&mut op, "tags", small_prefetch())?;
    for key in ["red", "green", "blue"] {
        for n in (0..120).rev() {
            assert!(tree.put(&mut op, &key.to_owned(), rid(n))?);
        }
    }
    assert!(!tree.put(&mut op, &"red".to_owned(), rid(5))?);
    op.commit()?;
    assert_eq!(tree.size()?, 360);

    let red: Vec<Rid> = tree.get(&"red".to_owned())?.collect::<Result<_>>()?;
    assert_eq!(red, (0..120).rev().map(rid).collect::<Vec<_>>());

    let mut op = ops.start_atomic_operation()?;
    assert!(tree.remove(&mut op, &"red".to_owned(), rid(60))?);
    assert!(!tree.remove(&mut op, &"red".to_owned(), rid(60))?);
    assert!(!tree.remove(&mut op, &"red".to_owned(), rid(500))?);
    assert!(!tree.remove(&mut op, &"purple".to_owned(), rid(1))?);
    op.commit()?;
    assert_eq!(tree.size()?, 359);
    assert_eq!(tree.get(&"red".to_owned())?.count(), 119);

    let all = collect(tree.iterate_entries_between(&"a".to_owned(), true, &"z".to_owned(), true, true)?)?;
    let mut back = collect(tree.iterate_entries_between(&"a".to_owned(), true, &"z".to_owned(), true, false)?)?;
    back.reverse();
    assert_eq!(all, back);
    assert_eq!(all.len(), 359);
    let keys: Vec<String> = tree.key_stream().collect::<Result<_>>()?;
    assert_eq!(keys, vec!["blue", "green", "red"]);
    tree.check()?;
    Ok(())
}

#[test]
fn null_keys_live_beside_the_tree() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let single = SingleValueTree::<u64>::create(&mut op, "single_nulls", BTreeOptions::default())?;
    let multi = MultiValueTree::<u64>::create(&mut op, "multi_nulls", BTreeOptions::default())?;
    single.put_null(&mut op, rid(1))?;
    single.put_null(&mut op, rid(2))?;
    single.put(&mut op, &1, rid(3))?;
    for n in 0..400 {
        assert!(multi.put_null(&mut op, rid(n))?);
    }
    assert!(!multi.put_null(&mut op, rid(3))?);
    op.commit()?;

    assert_eq!(single.get_null()?, Some(rid(2)));
    assert_eq!(single.size()?, 2);
    assert_eq!(multi.get_null()?.len(), 400);
    assert_eq!(multi.size()?, 400);

    let mut op = ops.start_atomic_operation()?;
    assert_eq!(single.remove_null(&mut op)?, Some(rid(2)));
    assert!(multi.remove_null(&mut op, rid(399))?);
    assert!(!multi.remove_null(&mut op, rid(399))?);
    op.commit()?;
    assert_eq!(single.get_null()?, None);
    assert_eq!(multi.get_null()?, (0..399).map(rid).collect::<Vec<_>>());
    assert_eq!(multi.check()?.null_entries, 399);
    Ok(())
}

#[test]
fn size_counts_null_values_from_the_entry_point() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = MultiValueTree::<u64>::create(&mut op, "sized", BTreeOptions::default())?;
    for n in 0..50 {
        tree.put(&mut op, &(n as u64 % 5), rid(n))?;
    }
    // Spans three null bucket pages.
    for n in 0..700 {
        assert!(tree.put_null(&mut op, rid(n))?);
    }
    op.commit()?;
    assert_eq!(tree.size()?, 750);
    assert_eq!(tree.check()?.null_entries, 700);

    let mut op = ops.start_atomic_operation()?;
    assert!(tree.remove_null(&mut op, rid(10))?);
    assert_eq!(tree.size_in(&op)?, 749);
    op.rollback();
    assert_eq!(tree.size()?, 750);

    let reopened = MultiValueTree::<u64>::load(&ops, "sized", BTreeOptions::default())?;
    assert_eq!(reopened.size()?, 750);

    let mut op = ops.start_atomic_operation()?;
    let cleared = tree.clear_null(&mut op)?;
    assert_eq!(cleared, (0..700).map(rid).collect::<Vec<_>>());
    assert_eq!(tree.size_in(&op)?, 50);
    for n in 0..3 {
        tree.put_null(&mut op, rid(n))?;
    }
    op.commit()?;
    assert_eq!(tree.size()?, 53);
    let shape = tree.check()?;
    assert_eq!((shape.entries, shape.null_entries), (50, 3));

    let mut op = ops.start_atomic_operation()?;
    let single = SingleValueTree::<u64>::create(&mut op, "sized_single", BTreeOptions::default())?;
    single.put_null(&mut op, rid(1))?;
    single.put_null(&mut op, rid(2))?;
    assert_eq!(single.size_in(&op)?, 1);
    assert_eq!(single.remove_null(&mut op)?, Some(rid(2)));
    assert_eq!(single.remove_null(&mut op)?, None);
    op.commit()?;
    assert_eq!(single.size()?, 0);
    single.check()?;
    Ok(())
}

#[test]
fn pair_index_locates_values_of_crowded_keys() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = MultiValueTree::<u64>::create(&mut op, "crowded", BTreeOptions::default())?;
    op.commit()?;
    for batch in 0..6 {
        let mut op = ops.start_atomic_operation()?;
        for n in batch * 500..(batch + 1) * 500 {
            assert!(tree.put(&mut op, &1, rid(n))?);
            assert!(tree.put_null(&mut op, rid(n))?);
        }
        op.commit()?;
    }

    let mut op = ops.start_atomic_operation()?;
    assert!(!tree.put(&mut op, &1, rid(2_500))?);
    assert!(!tree.put_null(&mut op, rid(2_500))?);
    assert!(tree.put(&mut op, &2, rid(2_500))?);
    for n in (0..3_000).step_by(3) {
        assert!(tree.remove(&mut op, &1, rid(n))?);
        assert!(tree.remove_null(&mut op, rid(n))?);
    }
    assert!(!tree.remove(&mut op, &1, rid(0))?);
    assert!(!tree.remove(&mut op, &2, rid(1))?);
    assert!(!tree.remove_null(&mut op, rid(0))?);
    assert!(tree.put_null(&mut op, rid(0))?);
    op.commit()?;

    let survivors: Vec<Rid> = (0..3_000).filter(|n| n % 3 != 0).map(rid).collect();
    let values: Vec<Rid> = tree.get(&1)?.collect::<Result<_>>()?;
    assert_eq!(values, survivors);
    let mut nulls = survivors.clone();
    nulls.push(rid(0));
    assert_eq!(tree.get_null()?, nulls);
    assert_eq!(tree.size()?, 2_001 + 2_001);
    let shape = tree.check()?;
    assert_eq!((shape.entries, shape.null_entries), (2_001, 2_001));
    Ok(())
}

#[test]
fn variable_length_removals_keep_separators_within_parent_capacity() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let key = |n: u32| {
        let mut key = n.to_be_bytes().to_vec();
        key.resize(8 + (n as usize * 37) % 593, b'k');
        key
    };
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<Vec<u8>>::create(&mut op, "ragged", BTreeOptions::default())?;
    op.commit()?;
    const COUNT: u32 = 1_500;
    for batch in (0..COUNT).step_by(100) {
        let mut op = ops.start_atomic_operation()?;
        for n in batch..batch + 100 {
            tree.put(&mut op, &key(n), rid(i64::from(n)))?;
        }
        op.commit()?;
    }
    assert!(tree.check()?.depth >= 3);

    let order: Vec<u32> = (0..COUNT).map(|i| (i * 7_919) % COUNT).collect();
    for chunk in order.chunks(100) {
        let mut op = ops.start_atomic_operation()?;
        for n in chunk {
            assert_eq!(tree.remove(&mut op, &key(*n))?, Some(rid(i64::from(*n))));
        }
        op.commit()?;
        tree.check()?;
    }
    let stats = tree.stats();
    assert!(stats.redistributions > 0);
    assert!(stats.merges > 0);
    assert_eq!(tree.size()?, 0);
    assert_eq!(tree.check()?.depth, 1);
    Ok(())
}

#[test]
fn oversized_keys_are_refused() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let options = BTreeOptions {
        max_key_size: 16,
        ..BTreeOptions::default()
    };
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<String>::create(&mut op, "short", options)?;
    let err = tree
        .put(&mut op, &"x".repeat(17), rid(1))
        .expect_err("key over the limit");
    assert!(matches!(err, StoreError::KeyTooLarge { size: 17, max: 16 }));
    tree.put(&mut op, &"x".repeat(16), rid(1))?;
    op.commit()?;

    let capped = {
        let mut op = ops.start_atomic_operation()?;
        let tree = SingleValueTree::<String>::create(&mut op, "capped", BTreeOptions {
            max_key_size: 60_000,
            ..BTreeOptions::default()
        })?;
        op.commit()?;
        tree.max_key_size()
    };
    assert!(capped < 1_024);
    Ok(())
}

#[test]
fn load_checks_key_type_and_cardinality() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    SingleValueTree::<u64>::create(&mut op, "typed", BTreeOptions::default())?;
    op.commit()?;
    assert!(matches!(
        SingleValueTree::<String>::load(&ops, "typed", BTreeOptions::default()),
        Err(StoreError::Invalid(_))
    ));
    assert!(matches!(
        MultiValueTree::<u64>::load(&ops, "typed", BTreeOptions::default()),
        Err(StoreError::Invalid(_))
    ));
    assert!(matches!(
        SingleValueTree::<u64>::load(&ops, "missing", BTreeOptions::default()),
        Err(StoreError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn create_refuses_encrypted_trees() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let options = BTreeOptions {
        encryption: Some("aes/gcm".to_owned()),
        ..BTreeOptions::default()
    };
    assert!(matches!(
        MultiValueTree::<u64>::create(&mut op, "sealed", options),
        Err(StoreError::Invalid(_))
    ));
    op.rollback();
    assert!(!dir.path().join("sealed.cbt").exists());

    let mut op = ops.start_atomic_operation()?;
    let tree = MultiValueTree::<u64>::create(&mut op, "plain", BTreeOptions::default())?;
    tree.put(&mut op, &9, rid(1))?;
    op.commit()?;
    let size: i64 = tree.size()?;
    assert_eq!(size, 1);
    Ok(())
}

#[test]
fn normalized_tree_orders_composite_keys() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = NormalizedKeyTree::create(&mut op, "composite", BTreeOptions::default())?;
    let mut expected = Vec::new();
    for (n, city) in ["oslo", "lima", "rome"].iter().enumerate() {
        for age in [-5i64, 30, 7] {
            let key = NormalizedKey(CompositeKey::default().push(*city).push(age));
            let value = rid(n as i64 * 100 + age);
            tree.put(&mut op, &key, value)?;
            expected.push((key, value));
        }
    }
    let null_city = NormalizedKey(CompositeKey::default().push(KeyValue::Null).push(1i64));
    tree.put(&mut op, &null_city, rid(-1))?;
    expected.push((null_city.clone(), rid(-1)));
    op.commit()?;
    expected.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(tree.first_key()?, Some(null_city));
    let lower = NormalizedKey(CompositeKey::default().push("lima"));
    let upper = NormalizedKey(CompositeKey::default().push("oslo").push(i64::MAX));
    let got = collect(tree.iterate_entries_between(&lower, true, &upper, true, true)?)?;
    let want: Vec<_> = expected
        .iter()
        .filter(|(k, _)| *k >= lower && *k <= upper)
        .cloned()
        .collect();
    assert_eq!(got, want);
    assert_eq!(got.len(), 6);
    Ok(())
}

#[test]
fn corrupted_bucket_reports_the_component_and_page() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut op, "broken", BTreeOptions::default())?;
    tree.put(&mut op, &1, rid(1))?;
    op.commit()?;

    let file = ops.cache().registry().file_id("broken.cbt").expect("tree file");
    let mut op = ops.start_atomic_operation()?;
    set_kind(op.page_mut(PageKey::new(file, 1))?, PageKind::Free);
    op.commit()?;

    match tree.get(&1) {
        Err(StoreError::Structure { component, page, .. }) => {
            assert_eq!((component.as_str(), page), ("broken", 1));
        }
        other => panic!("expected a structure error, got {other:?}"),
    }
    assert!(matches!(tree.check(), Err(StoreError::Structure { .. })));
    Ok(())
}

#[test]
fn deleted_tree_cannot_be_loaded() -> Result<()> {
    let dir = tempdir()?;
    let ops = manager(dir.path())?;
    let mut op = ops.start_atomic_operation()?;
    let tree = MultiValueTree::<i32>::create(&mut op, "gone", BTreeOptions::default())?;
    tree.put(&mut op, &1, rid(1))?;
    op.commit()?;

    let mut op = ops.start_atomic_operation()?;
    tree.delete(&mut op)?;
    op.commit()?;
    assert!(MultiValueTree::<i32>::load(&ops, "gone", BTreeOptions::default()).is_err());
    assert!(!dir.path().join("gone.cbt").exists());
    assert!(!dir.path().join("gone.nbt").exists());
    assert!(!dir.path().join("gone.pairs.cbt").exists());
    Ok(())
}

#[derive(Debug, Clone)]
enum PropOp {
    Put(u16, i64),
    Remove(u16),
}

fn op_strategy() -> impl Strategy<Value = PropOp> {
    prop_oneof![
        3 => (0u16..512, any::<i64>()).prop_map(|(k, v)| PropOp::Put(k, v)),
        2 => (0u16..512).prop_map(PropOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn tree_matches_btreemap_random_ops(ops_seq in prop::collection::vec(op_strategy(), 1..400)) {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path()).unwrap();
        let mut op = ops.start_atomic_operation().unwrap();
        let tree = SingleValueTree::<String>::create(&mut op, "prop", small_prefetch()).unwrap();
        let mut model = BTreeMap::new();
        for step in &ops_seq {
            match step {
                PropOp::Put(k, v) => {
                    let key = format!("key-{k:05}-{}", "x".repeat(usize::from(*k % 40)));
                    tree.put(&mut op, &key, Rid::new(1, *v)).unwrap();
                    model.insert(key, Rid::new(1, *v));
                }
                PropOp::Remove(k) => {
                    let key = format!("key-{k:05}-{}", "x".repeat(usize::from(*k % 40)));
                    prop_assert_eq!(tree.remove(&mut op, &key).unwrap(), model.remove(&key));
                }
            }
        }
        op.commit().unwrap();
        let got: Vec<(String, Rid)> = tree
            .iterate_entries_major(&String::new(), true, true)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let want: Vec<(String, Rid)> = model.into_iter().collect();
        prop_assert_eq!(&got, &want);
        let mut back: Vec<(String, Rid)> = tree
            .iterate_entries_major(&String::new(), true, false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        back.reverse();
        prop_assert_eq!(back, want);
        prop_assert_eq!(tree.check().unwrap().entries, got.len() as u64);
    }
}
