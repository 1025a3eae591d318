use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::queue::{queue, QueueConsumer, QueueProducer};
use crate::types::{InterruptCause, Result, StoreError};

const WAITING: u8 = 0;
const RELEASED: u8 = 1;
const INTERRUPTED: u8 = 2;

struct Waiter {
    thread: Thread,
    state: AtomicU8,
}

impl Waiter {
    fn signal(&self, to: u8) -> bool {
        let won = self
            .state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.thread.unpark();
        won
    }
}

/// Threads parked until a coordinator releases or interrupts all of them.
///
/// Linking a node never takes a lock; the mutex only serializes the coordinators
/// that drain the list.
pub struct WaitList {
    producer: QueueProducer<Arc<Waiter>>,
    consumer: Mutex<QueueConsumer<Arc<Waiter>>>,
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitList {
    /// Creates an empty list.
    pub fn new() -> Self {
        let (producer, consumer) = queue();
        Self {
            producer,
            consumer: Mutex::new(consumer),
        }
    }

    /// Links a node for the calling thread onto the tail of the list.
    ///
    /// Callers re-check their wake-up condition after enqueueing and before waiting.
    pub fn enqueue(&self) -> WaitTicket {
        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            state: AtomicU8::new(WAITING),
        });
        self.producer.offer(Arc::clone(&waiter));
        WaitTicket { waiter }
    }

    /// Unlinks every parked node and wakes its thread. Returns how many were woken.
    pub fn release_all(&self) -> usize {
        self.drain(RELEASED)
    }

    /// Unlinks every parked node and makes its wait fail with
    /// [`InterruptCause::Requested`].
    pub fn interrupt_all(&self) -> usize {
        self.drain(INTERRUPTED)
    }

    /// True when no node is linked.
    pub fn is_empty(&self) -> bool {
        self.producer.is_empty()
    }

    fn drain(&self, to: u8) -> usize {
        let mut consumer = self.consumer.lock();
        let mut woken = 0;
        while let Some(waiter) = consumer.poll() {
            if waiter.signal(to) {
                woken += 1;
            }
        }
        woken
    }
}

/// Handle on a node linked by [`WaitList::enqueue`].
pub struct WaitTicket {
    waiter: Arc<Waiter>,
}

impl WaitTicket {
    /// True once a coordinator released this node.
    pub fn is_released(&self) -> bool {
        self.waiter.state.load(Ordering::Acquire) == RELEASED
    }

    /// Parks the calling thread until the node is released.
    ///
    /// Interruption or an elapsed `timeout` surfaces as [`StoreError::Interrupted`];
    /// the node stays linked and is unlinked by the next drain.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            match self.waiter.state.load(Ordering::Acquire) {
                RELEASED => return Ok(()),
                INTERRUPTED => return Err(StoreError::Interrupted(InterruptCause::Requested)),
                _ => {}
            }
            match timeout {
                None => thread::park(),
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(StoreError::Interrupted(InterruptCause::TimedOut(limit)));
                    }
                    thread::park_timeout(limit - elapsed);
                }
            }
        }
    }
}
