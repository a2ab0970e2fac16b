use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Fixed-capacity handoff buffer between pipeline stages.
///
/// `enqueue` never blocks: when the queue is full (or EOF has been signalled)
/// the *new* value is silently discarded, running its destructor on the
/// producer's thread. Under sustained overload this keeps latency bounded at
/// `capacity * interarrival` instead of growing without limit.
///
/// `dequeue` blocks until a value is available or EOF is reached; after
/// `signal_eof` the remaining values are drained in FIFO order before `None`
/// is returned. One consumer is supported; producers may call `enqueue` from
/// any thread.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    eof: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                eof: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Returns true if the value was accepted, false if it was dropped.
    /// The rejected value's destructor runs outside the queue lock.
    pub fn enqueue(&self, value: T) -> bool {
        let rejected = {
            let mut inner = self.inner.lock().unwrap();
            if inner.eof || inner.items.len() >= self.capacity {
                Some(value)
            } else {
                inner.items.push_back(value);
                None
            }
        };
        match rejected {
            Some(value) => {
                drop(value);
                false
            }
            None => {
                self.ready.notify_one();
                true
            }
        }
    }

    /// Blocks until a value or EOF. `None` means the queue is drained and EOF
    /// is set, and is returned for every call thereafter.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(value) = inner.items.pop_front() {
                return Some(value);
            }
            if inner.eof {
                return None;
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }

    /// Sticky: no enqueue succeeds afterwards. Wakes all blocked consumers.
    pub fn signal_eof(&self) {
        self.inner.lock().unwrap().eof = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Increments a shared counter when dropped.
    struct DropGuard(Arc<AtomicUsize>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            assert!(q.enqueue(i));
        }
        q.signal_eof();
        assert_eq!(q.dequeue(), Some(0));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn drop_on_full_discards_exactly_the_overflow() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = BoundedQueue::new(4);
        // 10 enqueues with no intervening dequeue: exactly 10 - 4 are dropped.
        for _ in 0..10 {
            q.enqueue(DropGuard(drops.clone()));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
        assert_eq!(q.len(), 4);
        q.signal_eof();
        while q.dequeue().is_some() {}
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn enqueue_after_eof_is_rejected() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = BoundedQueue::new(4);
        q.enqueue(DropGuard(drops.clone()));
        q.signal_eof();
        assert!(!q.enqueue(DropGuard(drops.clone())));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        // the value enqueued before EOF is still delivered
        assert!(q.dequeue().is_some());
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn eof_wakes_blocked_consumer() {
        let q = Arc::new(BoundedQueue::<u32>::new(2));
        let q2 = q.clone();
        let consumer = thread::spawn(move || q2.dequeue());
        thread::sleep(Duration::from_millis(50));
        q.signal_eof();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn concurrent_producers() {
        let q = Arc::new(BoundedQueue::new(64));
        let mut producers = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..16 {
                    q.enqueue(t * 16 + i);
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        q.signal_eof();
        let mut seen = Vec::new();
        while let Some(v) = q.dequeue() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn overload_drops_everything_beyond_capacity_while_consumer_stalls() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = Arc::new(BoundedQueue::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                // stalled consumer: wakes late, then drains
                thread::sleep(Duration::from_millis(100));
                let mut consumed = 0usize;
                while q.dequeue().is_some() {
                    consumed += 1;
                }
                consumed
            })
        };
        let mut accepted = 0usize;
        for _ in 0..120 {
            if q.enqueue(DropGuard(drops.clone())) {
                accepted += 1;
            }
        }
        // the producer outpaced the consumer for the whole burst
        assert_eq!(drops.load(Ordering::SeqCst), 120 - accepted);
        q.signal_eof();
        let consumed = consumer.join().unwrap();
        assert_eq!(consumed, accepted);
        // every value was released exactly once, dropped or consumed
        assert_eq!(drops.load(Ordering::SeqCst), 120);
    }

    #[test]
    fn size_never_exceeds_capacity_under_load() {
        let q = Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let producer = thread::spawn(move || {
            for i in 0..1000 {
                q2.enqueue(i);
                assert!(q2.len() <= 4);
            }
            q2.signal_eof();
        });
        let mut last = -1i64;
        while let Some(v) = q.dequeue() {
            // FIFO: values arrive in increasing order even with drops between
            assert!(i64::from(v) > last);
            last = i64::from(v);
        }
        producer.join().unwrap();
    }
}
