#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::primitives::concurrency::WaitList;
use crate::types::{InterruptCause, Result, StoreError};

/// What happens to new atomic operations while a freeze is in effect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreezeMode {
    /// Admission fails with [`StoreError::OperationsFrozen`].
    Reject,
    /// Admission parks the caller until the last freeze is lifted.
    Park,
}

/// Admission state of the atomic operations coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    /// New operations are admitted.
    Running,
    /// A freeze was requested; operations admitted earlier are still running.
    Freezing,
    /// A freeze is in effect and no operation is running.
    Frozen,
}

/// Counts running operations and parks callers on either side of a freeze.
///
/// Admission and completion only touch atomics. Threads that have to wait link a
/// node onto one of two wait lists: freezers wait for the running count to reach
/// zero, admissions wait for the last freeze to be lifted.
pub(crate) struct Freezer {
    active: AtomicUsize,
    freeze_requests: AtomicUsize,
    reject_freezes: AtomicUsize,
    drained: WaitList,
    admission: WaitList,
}

impl Freezer {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            freeze_requests: AtomicUsize::new(0),
            reject_freezes: AtomicUsize::new(0),
            drained: WaitList::new(),
            admission: WaitList::new(),
        }
    }

    /// Registers a new running operation.
    pub(crate) fn enter(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::new(timeout);
        loop {
            if self.freeze_requests.load(Ordering::SeqCst) > 0 {
                if self.reject_freezes.load(Ordering::SeqCst) > 0 {
                    return Err(StoreError::OperationsFrozen);
                }
                let ticket = self.admission.enqueue();
                if self.freeze_requests.load(Ordering::SeqCst) == 0 {
                    continue;
                }
                debug!("atomic.admission.park");
                ticket.wait(deadline.remaining()?)?;
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            if self.freeze_requests.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            // A freeze slipped in between the check and the increment.
            self.leave();
        }
    }

    /// Deregisters a running operation, waking freezers once none is left.
    pub(crate) fn leave(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "operation left twice");
        if previous == 1 && self.freeze_requests.load(Ordering::SeqCst) > 0 {
            self.drained.release_all();
        }
    }

    /// Stops admission and waits until every running operation ended.
    ///
    /// On failure the freeze request is withdrawn again.
    pub(crate) fn freeze(&self, mode: FreezeMode, timeout: Option<Duration>) -> Result<()> {
        if mode == FreezeMode::Reject {
            self.reject_freezes.fetch_add(1, Ordering::SeqCst);
        }
        self.freeze_requests.fetch_add(1, Ordering::SeqCst);
        let deadline = Deadline::new(timeout);
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            let ticket = self.drained.enqueue();
            if self.active.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            let waited = deadline
                .remaining()
                .and_then(|remaining| ticket.wait(remaining));
            if let Err(err) = waited {
                self.unfreeze(mode);
                return Err(err);
            }
        }
    }

    /// Withdraws one freeze; the last one lets parked admissions through.
    pub(crate) fn unfreeze(&self, mode: FreezeMode) {
        if mode == FreezeMode::Reject {
            self.reject_freezes.fetch_sub(1, Ordering::SeqCst);
        }
        if self.freeze_requests.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.admission.release_all();
        }
    }

    pub(crate) fn state(&self) -> FreezerState {
        if self.freeze_requests.load(Ordering::SeqCst) == 0 {
            FreezerState::Running
        } else if self.active.load(Ordering::SeqCst) == 0 {
            FreezerState::Frozen
        } else {
            FreezerState::Freezing
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Makes every parked thread give up with [`InterruptCause::Requested`].
    pub(crate) fn interrupt(&self) -> usize {
        self.admission.interrupt_all() + self.drained.interrupt_all()
    }
}

struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    fn remaining(&self) -> Result<Option<Duration>> {
        match self.limit {
            None => Ok(None),
            Some(limit) => match limit.checked_sub(self.start.elapsed()) {
                Some(left) if !left.is_zero() => Ok(Some(left)),
                _ => Err(StoreError::Interrupted(InterruptCause::TimedOut(limit))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn freeze_without_operations_is_immediate() {
        let freezer = Freezer::new();
        freezer.freeze(FreezeMode::Reject, None).unwrap();
        assert_eq!(freezer.state(), FreezerState::Frozen);
        assert!(matches!(
            freezer.enter(None),
            Err(StoreError::OperationsFrozen)
        ));
        freezer.unfreeze(FreezeMode::Reject);
        assert_eq!(freezer.state(), FreezerState::Running);
        freezer.enter(None).unwrap();
        assert_eq!(freezer.active(), 1);
        freezer.leave();
    }

    #[test]
    fn freeze_waits_for_running_operations() {
        let freezer = Arc::new(Freezer::new());
        freezer.enter(None).unwrap();
        let frozen = Arc::new(AtomicBool::new(false));
        let handle = {
            let freezer = Arc::clone(&freezer);
            let frozen = Arc::clone(&frozen);
            thread::spawn(move || {
                freezer.freeze(FreezeMode::Park, None).unwrap();
                frozen.store(true, Ordering::SeqCst);
            })
        };
        while freezer.state() != FreezerState::Freezing {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!frozen.load(Ordering::SeqCst));
        freezer.leave();
        handle.join().unwrap();
        assert!(frozen.load(Ordering::SeqCst));
        assert_eq!(freezer.state(), FreezerState::Frozen);
        freezer.unfreeze(FreezeMode::Park);
    }

    #[test]
    fn parked_admission_resumes_after_unfreeze() {
        let freezer = Arc::new(Freezer::new());
        freezer.freeze(FreezeMode::Park, None).unwrap();
        let started = Arc::new(Barrier::new(2));
        let handle = {
            let freezer = Arc::clone(&freezer);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                started.wait();
                freezer.enter(None).unwrap();
                freezer.leave();
            })
        };
        started.wait();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(freezer.active(), 0);
        freezer.unfreeze(FreezeMode::Park);
        handle.join().unwrap();
        assert_eq!(freezer.state(), FreezerState::Running);
    }

    #[test]
    fn timed_out_freeze_is_withdrawn() {
        let freezer = Freezer::new();
        freezer.enter(None).unwrap();
        let err = freezer
            .freeze(FreezeMode::Reject, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Interrupted(InterruptCause::TimedOut(_))
        ));
        assert_eq!(freezer.state(), FreezerState::Running);
        freezer.leave();
        freezer.enter(None).unwrap();
        freezer.leave();
    }

    #[test]
    fn interrupted_admission_reports_cause() {
        let freezer = Arc::new(Freezer::new());
        freezer.freeze(FreezeMode::Park, None).unwrap();
        let handle = {
            let freezer = Arc::clone(&freezer);
            thread::spawn(move || freezer.enter(None))
        };
        while freezer.interrupt() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            handle.join().unwrap(),
            Err(StoreError::Interrupted(InterruptCause::Requested))
        ));
        freezer.unfreeze(FreezeMode::Park);
        assert_eq!(freezer.active(), 0);
    }
}
