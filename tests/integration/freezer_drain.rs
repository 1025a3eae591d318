#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cellstore::storage::{
    BTreeOptions, FreezeMode, FreezerState, SingleValueTree, Storage, StorageOptions,
};
use cellstore::types::{InterruptCause, Result, Rid, StoreError};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions {
        cache_pages: 256,
        auto_checkpoint_ms: None,
        ..StorageOptions::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn park_freeze_waits_for_running_operations_and_parks_new_ones() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "park", options())?;
    let ops = storage.atomic_operations();
    let mut running = ops.start_atomic_operation()?;
    let tree = SingleValueTree::<u64>::create(&mut running, "ids", BTreeOptions::default())?;
    tree.put(&mut running, &1, Rid::new(1, 1))?;

    let admitted = AtomicBool::new(false);
    let (frozen_tx, frozen_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::scope(|scope| -> Result<()> {
        let freezer = {
            let storage = &storage;
            scope.spawn(move || -> Result<()> {
                let guard = storage.freeze(FreezeMode::Park)?;
                frozen_tx.send(()).ok();
                release_rx.recv().ok();
                drop(guard);
                Ok(())
            })
        };
        assert!(wait_for(|| ops.state() == FreezerState::Freezing));

        let newcomer = scope.spawn(|| -> Result<()> {
            let op = ops.start_atomic_operation()?;
            admitted.store(true, Ordering::SeqCst);
            op.rollback();
            Ok(())
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst), "admission must park during a freeze");
        assert!(frozen_rx.try_recv().is_err(), "freeze waits for the running operation");

        running.commit()?;
        frozen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("freeze completes once the operation ended");
        assert_eq!(ops.state(), FreezerState::Frozen);
        assert!(!admitted.load(Ordering::SeqCst));

        release_tx.send(()).ok();
        freezer.join().expect("freezer panicked")?;
        newcomer.join().expect("newcomer panicked")?;
        Ok(())
    })?;

    assert!(admitted.load(Ordering::SeqCst));
    assert_eq!(ops.state(), FreezerState::Running);
    assert_eq!(tree.get(&1)?, Some(Rid::new(1, 1)));
    drop(tree);
    storage.close()
}

#[test]
fn reject_freeze_fails_admission_until_lifted() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "reject", options())?;
    let guard = storage.freeze(FreezeMode::Reject)?;
    let err = storage.begin_atomic_operation().map(|_| ()).unwrap_err();
    assert!(matches!(err, StoreError::OperationsFrozen));
    assert!(err.is_retryable());
    drop(guard);
    storage.begin_atomic_operation()?.rollback();
    storage.close()
}

#[test]
fn parked_admissions_can_be_interrupted() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(dir.path(), "interrupt", options())?;
    let ops = storage.atomic_operations();
    let guard = storage.freeze(FreezeMode::Park)?;
    thread::scope(|scope| {
        let parked = scope.spawn(|| ops.start_atomic_operation().map(|op| op.rollback()));
        let mut woken = 0;
        assert!(wait_for(|| {
            woken += ops.interrupt_waiters();
            woken > 0
        }));
        let outcome = parked.join().expect("parked thread panicked");
        assert!(matches!(
            outcome,
            Err(StoreError::Interrupted(InterruptCause::Requested))
        ));
    });
    drop(guard);
    storage.close()
}

#[test]
fn auto_checkpoint_runs_while_writers_are_active() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::open(
        dir.path(),
        "auto",
        StorageOptions {
            dwl_checkpoint_bytes: 64 * 1024,
            auto_checkpoint_ms: Some(5),
            ..options()
        },
    )?;
    let tree = {
        let mut op = storage.begin_atomic_operation()?;
        let tree = SingleValueTree::<u64>::create(&mut op, "ids", BTreeOptions::default())?;
        op.commit()?;
        tree
    };
    thread::scope(|scope| -> Result<()> {
        let mut writers = Vec::new();
        for writer in 0..3u64 {
            let (storage, tree) = (&storage, &tree);
            writers.push(scope.spawn(move || -> Result<()> {
                for n in 0..400u64 {
                    let mut op = storage.begin_atomic_operation()?;
                    let key = writer * 10_000 + n;
                    tree.put(&mut op, &key, Rid::new(writer as i32, n as i64))?;
                    op.commit()?;
                }
                Ok(())
            }));
        }
        for writer in writers {
            writer.join().expect("writer panicked")?;
        }
        Ok(())
    })?;
    assert!(wait_for(|| storage.stats().checkpoints > 0));
    assert_eq!(tree.size()?, 1_200);
    tree.check()?;
    drop(tree);
    storage.close()
}
