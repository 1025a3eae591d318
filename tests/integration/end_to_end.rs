#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use cellstore::storage::btree::{CompositeKey, NormalizedKey};
use cellstore::storage::{
    BTreeOptions, MultiValueTree, NormalizedKeyTree, SingleValueTree, Storage, StorageOptions,
};
use cellstore::types::{Result, Rid};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> StorageOptions {
    StorageOptions {
        cache_pages: 512,
        auto_checkpoint_ms: None,
        ..StorageOptions::default()
    }
}

#[test]
fn trees_survive_close_and_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    {
        let storage = Storage::open(dir.path(), "e2e", options())?;
        let ops = storage.atomic_operations();
        let mut op = ops.start_atomic_operation()?;
        let people = SingleValueTree::<String>::create(&mut op, "people", BTreeOptions::default())?;
        let tags = MultiValueTree::<u64>::create(&mut op, "tags", BTreeOptions::default())?;
        for n in 0..2_000i64 {
            people.put(&mut op, &format!("person-{n:05}"), Rid::new(1, n))?;
            tags.put(&mut op, &((n % 10) as u64), Rid::new(2, n))?;
        }
        people.put_null(&mut op, Rid::new(1, -1))?;
        op.commit()?;
        assert_eq!(people.size()?, 2_001);
        assert_eq!(tags.size()?, 2_000);
        drop((people, tags));
        storage.close()?;
    }

    let storage = Storage::open(dir.path(), "e2e", options())?;
    assert_eq!(storage.stats().restored_pages, 0);
    let ops = storage.atomic_operations();
    let people = SingleValueTree::<String>::load(ops, "people", BTreeOptions::default())?;
    let tags = MultiValueTree::<u64>::load(ops, "tags", BTreeOptions::default())?;
    assert_eq!(people.get(&"person-01234".to_owned())?, Some(Rid::new(1, 1234)));
    assert_eq!(people.get_null()?, Some(Rid::new(1, -1)));
    assert_eq!(people.first_key()?.as_deref(), Some("person-00000"));
    assert_eq!(people.last_key()?.as_deref(), Some("person-01999"));
    let sevens: Vec<Rid> = tags.get(&7)?.collect::<Result<_>>()?;
    assert_eq!(sevens.len(), 200);
    assert_eq!(sevens[0], Rid::new(2, 7));
    assert_eq!(sevens[199], Rid::new(2, 1997));
    let shape = people.check()?;
    assert_eq!(shape.entries, 2_000);
    assert!(shape.depth >= 2);
    tags.check()?;
    drop((people, tags));
    storage.close()
}

#[test]
fn concurrent_writers_and_readers_share_a_tree() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "concurrent", options())?;
    let tree = {
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
        op.commit()?;
        Arc::new(tree)
    };

    thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::new();
        for writer in 0..4u64 {
            let tree = Arc::clone(&tree);
            let storage = &storage;
            handles.push(scope.spawn(move || -> Result<()> {
                for batch in 0..10u64 {
                    let mut op = storage.begin_atomic_operation()?;
                    for n in 0..25u64 {
                        let key = writer * 1_000 + batch * 25 + n;
                        tree.put(&mut op, &key, Rid::new(writer as i32, key as i64))?;
                    }
                    op.commit()?;
                }
                Ok(())
            }));
        }
        for _ in 0..2 {
            let tree = Arc::clone(&tree);
            handles.push(scope.spawn(move || -> Result<()> {
                for _ in 0..50 {
                    let keys: Vec<u64> = tree.key_stream().collect::<Result<_>>()?;
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    assert!(keys.len() <= 1_000);
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked")?;
        }
        Ok(())
    })?;

    assert_eq!(tree.size()?, 1_000);
    for writer in 0..4u64 {
        let key = writer * 1_000 + 249;
        assert_eq!(tree.get(&key)?, Some(Rid::new(writer as i32, key as i64)));
    }
    drop(tree);
    storage.close()
}

#[test]
fn normalized_tree_range_scan_after_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let key = |city: &str, age: i64| NormalizedKey(CompositeKey::new(vec![city.into(), age.into()]));
    {
        let storage = Storage::open(dir.path(), "norm", options())?;
        let mut op = storage.begin_atomic_operation()?;
        let tree = NormalizedKeyTree::create(&mut op, "city_age", BTreeOptions::default())?;
        for (n, city) in ["oslo", "bern", "lima"].iter().enumerate() {
            for age in 0..50i64 {
                tree.put(&mut op, &key(city, age), Rid::new(n as i32, age))?;
            }
        }
        op.commit()?;
        drop(tree);
        storage.close()?;
    }
    let storage = Storage::open(dir.path(), "norm", options())?;
    let tree = NormalizedKeyTree::load(storage.atomic_operations(), "city_age", BTreeOptions::default())?;
    let lima: Vec<Rid> = tree
        .iterate_entries_between(&key("lima", 10), true, &key("lima", 20), false, false)?
        .map(|entry| entry.map(|(_, rid)| rid))
        .collect::<Result<_>>()?;
    let expected: Vec<Rid> = (10..20i64).rev().map(|age| Rid::new(2, age)).collect();
    assert_eq!(lima, expected);
    assert_eq!(tree.first_key()?, Some(key("bern", 0)));
    drop(tree);
    storage.close()
}

#[test]
fn options_roundtrip_through_toml_and_stats_serialize() -> Result<()> {
    init_tracing();
    let text = "page_size = 8192\ncache_pages = 64\nauto_checkpoint_ms = 250\n";
    let parsed = StorageOptions::from_toml_str(text).map_err(|err| {
        cellstore::StoreError::Config(err.to_string())
    })?;
    assert_eq!(parsed.page_size, 8192);
    assert_eq!(parsed.auto_checkpoint_ms, Some(250));
    assert!(StorageOptions::from_toml_str("page_size = 5000\n").is_err());
    assert!(StorageOptions::from_toml_str("no_such_option = 1\n").is_err());

    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "toml", parsed)?;
    let json = serde_json::to_value(storage.stats()).map_err(|err| {
        cellstore::StoreError::Config(err.to_string())
    })?;
    assert!(json.get("cache").is_some());
    assert!(json.get("dwl").is_some());
    storage.close()
}
