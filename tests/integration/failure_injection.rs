#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cellstore::primitives::io::{FileIo, FileOpener, StdFileIo};
use cellstore::primitives::pager::Synchronous;
use cellstore::storage::{BTreeOptions, SingleValueTree, Storage, StorageOptions};
use cellstore::types::{Result, Rid, StoreError};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions {
        cache_pages: 256,
        synchronous: Synchronous::Full,
        flush_retries: 1,
        flush_retry_backoff_ms: 1,
        auto_checkpoint_ms: None,
        ..StorageOptions::default()
    }
}

/// Fails every write to tree data files while `fail` is set.
struct FailingOpener {
    fail: Arc<AtomicBool>,
}

struct FailingFile {
    inner: StdFileIo,
    data_file: bool,
    fail: Arc<AtomicBool>,
}

impl FileOpener for FailingOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(FailingFile {
            inner: StdFileIo::open(path)?,
            data_file: path.extension().is_some_and(|ext| ext == "cbt"),
            fail: Arc::clone(&self.fail),
        }))
    }
}

impl FileIo for FailingFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.data_file && self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("injected write failure").into());
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

#[test]
fn persistent_flush_failure_fails_the_storage_closed() -> Result<()> {
    let dir = tempdir()?;
    let fail = Arc::new(AtomicBool::new(false));
    let storage = Storage::open_with(
        dir.path(),
        "failing",
        options(),
        Arc::new(FailingOpener {
            fail: Arc::clone(&fail),
        }),
    )?;
    let reported = Arc::new(AtomicUsize::new(0));
    let fatal_seen = Arc::new(AtomicBool::new(false));
    {
        let (reported, fatal_seen) = (Arc::clone(&reported), Arc::clone(&fatal_seen));
        storage.register_exception_listener(Arc::new(move |err: &StoreError| {
            reported.fetch_add(1, Ordering::SeqCst);
            if matches!(err, StoreError::Fatal(_)) {
                fatal_seen.store(true, Ordering::SeqCst);
            }
        }));
    }

    let mut op = storage.begin_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
    tree.put(&mut op, &1, Rid::new(1, 1))?;
    op.commit()?;

    fail.store(true, Ordering::SeqCst);
    let mut op = storage.begin_atomic_operation()?;
    tree.put(&mut op, &2, Rid::new(1, 2))?;
    assert!(op.commit().is_err());

    assert!(fatal_seen.load(Ordering::SeqCst));
    assert!(reported.load(Ordering::SeqCst) >= 2, "one retry plus the fatal report");
    assert!(matches!(
        storage.begin_atomic_operation().map(|_| ()),
        Err(StoreError::Fatal(_))
    ));
    assert!(storage.stats().cache.flush_errors >= 2);
    drop(tree);
    Ok(())
}

#[test]
fn transient_flush_failure_is_retried() -> Result<()> {
    let dir = tempdir()?;
    let fail = Arc::new(AtomicBool::new(false));
    let storage = Storage::open_with(
        dir.path(),
        "transient",
        StorageOptions {
            flush_retries: 50,
            flush_retry_backoff_ms: 2,
            synchronous: Synchronous::Normal,
            ..options()
        },
        Arc::new(FailingOpener {
            fail: Arc::clone(&fail),
        }),
    )?;
    let retries = Arc::new(AtomicUsize::new(0));
    {
        let (retries, fail) = (Arc::clone(&retries), Arc::clone(&fail));
        storage.register_exception_listener(Arc::new(move |_: &StoreError| {
            if retries.fetch_add(1, Ordering::SeqCst) >= 2 {
                fail.store(false, Ordering::SeqCst);
            }
        }));
    }
    let mut op = storage.begin_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
    fail.store(true, Ordering::SeqCst);
    for n in 0..100u64 {
        tree.put(&mut op, &n, Rid::new(1, n as i64))?;
    }
    op.commit()?;
    storage.checkpoint()?;
    assert!(retries.load(Ordering::SeqCst) >= 3);
    assert_eq!(tree.size()?, 100);
    drop(tree);
    storage.close()?;

    let storage = Storage::open(dir.path(), "transient", options())?;
    let tree = SingleValueTree::<u64>::load(storage.atomic_operations(), "ids", BTreeOptions::default())?;
    assert_eq!(tree.get(&99)?, Some(Rid::new(1, 99)));
    drop(tree);
    storage.close()
}

#[test]
fn torn_bucket_on_disk_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = Storage::open(dir.path(), "torn", options())?;
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
        for n in 0..10u64 {
            tree.put(&mut op, &n, Rid::new(1, n as i64))?;
        }
        op.commit()?;
        drop(tree);
        storage.close()?;
    }
    {
        let page_size = u64::from(options().page_size);
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("ids.cbt"))?;
        file.seek(SeekFrom::Start(page_size + page_size / 2))?;
        file.write_all(&[0xA5; 64])?;
        file.sync_all()?;
    }
    let storage = Storage::open(dir.path(), "torn", options())?;
    let tree = SingleValueTree::<u64>::load(storage.atomic_operations(), "ids", BTreeOptions::default())?;
    let err = tree.get(&3).map(|_| ()).unwrap_err();
    assert!(
        matches!(err, StoreError::Structure { .. } | StoreError::Corruption(_)),
        "unexpected error: {err}"
    );
    drop(tree);
    storage.close()
}
