use std::hint;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Spins before the consumer starts yielding while a producer finishes linking.
const LINK_SPIN_LIMIT: u32 = 128;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

struct Shared<T> {
    /// Current stub node; only the consumer moves it.
    head: AtomicPtr<Node<T>>,
    /// Last linked (or being linked) node; producers swap it.
    tail: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    _owns: PhantomData<*mut T>,
}

// SAFETY: values cross threads by move only; nodes are reachable from one consumer
// and freed only after every producer finished linking them.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: no producer or consumer is alive, so we own every node.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

/// Creates an empty queue, returning its cloneable producer and its single consumer.
pub fn queue<T: Send>() -> (QueueProducer<T>, QueueConsumer<T>) {
    let stub = Node::alloc(None);
    let shared = Arc::new(Shared {
        head: AtomicPtr::new(stub),
        tail: AtomicPtr::new(stub),
        len: AtomicUsize::new(0),
        _owns: PhantomData,
    });
    (
        QueueProducer {
            shared: Arc::clone(&shared),
        },
        QueueConsumer { shared },
    )
}

/// Appends items; any number of threads may hold a clone.
pub struct QueueProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> QueueProducer<T> {
    /// Appends `value`. Never blocks.
    pub fn offer(&self, value: T) {
        let node = Node::alloc(Some(value));
        self.shared.len.fetch_add(1, Ordering::Relaxed);
        let prev = self.shared.tail.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` cannot be freed until its `next` is set, and only this
        // producer sets it.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// True when head and tail reference the same node.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Relaxed)
    }
}

/// Removes items; exactly one exists per queue.
pub struct QueueConsumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> QueueConsumer<T> {
    /// Takes the oldest linked item, or `None` when the queue is empty.
    ///
    /// If a producer already swapped the tail but has not linked its node yet,
    /// spins briefly (then yields) until the link becomes visible.
    pub fn poll(&mut self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        // SAFETY: the head node is owned by the consumer and stays allocated.
        let mut next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            if self.shared.tail.load(Ordering::Acquire) == head {
                return None;
            }
            let mut spins = 0u32;
            loop {
                // SAFETY: as above.
                next = unsafe { (*head).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break;
                }
                if spins < LINK_SPIN_LIMIT {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
        self.shared.head.store(next, Ordering::Release);
        // SAFETY: `next` is now the stub owned by the consumer; producers only touch
        // the node they swapped out of the tail, and that link is complete.
        let value = unsafe { (*next).value.take() };
        // SAFETY: the old head is unreachable from both the tail and the new head.
        drop(unsafe { Box::from_raw(head) });
        self.shared.len.fetch_sub(1, Ordering::Relaxed);
        value
    }

    /// True when head and tail reference the same node.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}
