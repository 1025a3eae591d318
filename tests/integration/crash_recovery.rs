#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cellstore::primitives::io::{FileIo, FileOpener, StdFileIo};
use cellstore::primitives::pager::Synchronous;
use cellstore::storage::{BTreeOptions, MultiValueTree, SingleValueTree, Storage, StorageOptions};
use cellstore::types::{Result, Rid};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions {
        cache_pages: 1024,
        synchronous: Synchronous::Full,
        auto_checkpoint_ms: None,
        ..StorageOptions::default()
    }
}

/// Drops writes to tree data files while `lose` is set, leaving the double-write
/// log as the only copy of the committed pages.
struct LossyOpener {
    lose: Arc<AtomicBool>,
}

struct LossyFile {
    inner: StdFileIo,
    data_file: bool,
    lose: Arc<AtomicBool>,
}

impl FileOpener for LossyOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        let data_file = path
            .extension()
            .is_some_and(|ext| ext == "cbt" || ext == "nbt");
        Ok(Arc::new(LossyFile {
            inner: StdFileIo::open(path)?,
            data_file,
            lose: Arc::clone(&self.lose),
        }))
    }
}

impl FileIo for LossyFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.data_file && self.lose.load(Ordering::SeqCst) {
            return Ok(());
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

fn dwl_segments(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "dwl"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn committed_pages_are_restored_from_the_double_write_log() -> Result<()> {
    let dir = tempdir()?;
    let lose = Arc::new(AtomicBool::new(false));
    {
        let opener = Arc::new(LossyOpener {
            lose: Arc::clone(&lose),
        });
        let storage = Storage::open_with(dir.path(), "crash", options(), opener)?;
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
        op.commit()?;
        storage.checkpoint()?;

        lose.store(true, Ordering::SeqCst);
        let mut op = storage.begin_atomic_operation()?;
        for n in 0..1_500u64 {
            tree.put(&mut op, &n, Rid::new(3, n as i64))?;
        }
        op.commit()?;
        assert_eq!(tree.size()?, 1_500);
        drop(tree);
        // No close: the log keeps every page image written since the checkpoint.
    }
    assert!(dwl_segments(dir.path()) > 0);

    let storage = Storage::open(dir.path(), "crash", options())?;
    assert!(storage.stats().restored_pages > 0);
    let tree = SingleValueTree::<u64>::load(storage.atomic_operations(), "ids", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 1_500);
    assert_eq!(tree.get(&777)?, Some(Rid::new(3, 777)));
    assert_eq!(tree.check()?.entries, 1_500);
    drop(tree);
    storage.close()?;
    assert_eq!(dwl_segments(dir.path()), 0);
    Ok(())
}

#[test]
fn reopen_after_unclean_shutdown_keeps_committed_state_only() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = Storage::open(dir.path(), "unclean", options())?;
        let mut op = storage.begin_atomic_operation()?;
        let tree = MultiValueTree::<String>::create(&mut op, "labels", BTreeOptions::default())?;
        for n in 0..300i64 {
            tree.put(&mut op, &format!("label-{}", n % 7), Rid::new(1, n))?;
        }
        op.commit()?;

        let mut op = storage.begin_atomic_operation()?;
        for n in 300..400i64 {
            tree.put(&mut op, &"label-0".to_owned(), Rid::new(1, n))?;
        }
        op.rollback();
        drop(tree);
    }

    let storage = Storage::open(dir.path(), "unclean", options())?;
    let tree = MultiValueTree::<String>::load(storage.atomic_operations(), "labels", BTreeOptions::default())?;
    assert_eq!(tree.size()?, 300);
    let zeros: Vec<Rid> = tree.get(&"label-0".to_owned())?.collect::<Result<_>>()?;
    assert_eq!(zeros.len(), 43);
    assert!(zeros.iter().all(|rid| rid.cluster_position < 300));
    tree.check()?;
    drop(tree);
    storage.close()
}

#[test]
fn tree_created_in_rolled_back_operation_does_not_exist_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = Storage::open(dir.path(), "ghost", options())?;
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<i64>::create(&mut op, "ghost", BTreeOptions::default())?;
        tree.put(&mut op, &1, Rid::new(1, 1))?;
        op.rollback();
        drop(tree);
        storage.close()?;
    }
    let storage = Storage::open(dir.path(), "ghost", options())?;
    assert!(SingleValueTree::<i64>::load(storage.atomic_operations(), "ghost", BTreeOptions::default()).is_err());
    storage.close()
}
