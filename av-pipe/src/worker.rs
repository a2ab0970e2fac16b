use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{AvError, Result};
use crate::queue::BoundedQueue;

/// A processing step that runs on its own thread behind a [`BoundedQueue`].
pub trait Stage: Send + 'static {
    type Input: Send + 'static;

    fn process(&mut self, input: Self::Input) -> Result<()>;

    /// Called once after the queue reached EOF, before the stage is dropped.
    /// Not called when `process` has already failed.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Shared<T> {
    queue: BoundedQueue<T>,
    failure: Mutex<Option<AvError>>,
}

impl<T> Shared<T> {
    fn enqueue(&self, value: T) -> Result<()> {
        // A failure inside the worker is re-raised to the next caller, once.
        if let Some(err) = self.failure.lock().unwrap().take() {
            drop(value);
            return Err(err);
        }
        self.queue.enqueue(value);
        Ok(())
    }
}

/// Wraps a [`Stage`] in a dedicated thread fed by a bounded queue.
///
/// Frames enqueued while the queue is full are silently dropped. Errors from
/// the stage stop the worker and surface on the next `enqueue` call. Dropping
/// the worker signals EOF, waits for the thread and then drops the stage,
/// which makes teardown ordering a matter of declaration order in the owner.
pub struct Worker<T> {
    shared: Arc<Shared<T>>,
    name: String,
    thread: Option<JoinHandle<()>>,
}

/// Cheap cloneable handle for feeding a [`Worker`] from another stage's
/// callback without borrowing the worker itself.
pub struct WorkerHandle<T>(Arc<Shared<T>>);

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        WorkerHandle(self.0.clone())
    }
}

impl<T> WorkerHandle<T> {
    pub fn enqueue(&self, value: T) -> Result<()> {
        self.0.enqueue(value)
    }
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<S>(name: &str, capacity: usize, mut stage: S) -> Self
    where
        S: Stage<Input = T>,
    {
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(capacity),
            failure: Mutex::new(None),
        });
        let inner = shared.clone();
        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut failed = false;
                while let Some(item) = inner.queue.dequeue() {
                    if let Err(err) = stage.process(item) {
                        log::error!("{}: {}", std::thread::current().name().unwrap_or("worker"), err);
                        *inner.failure.lock().unwrap() = Some(err);
                        // reject further input; queued items are drained below
                        inner.queue.signal_eof();
                        failed = true;
                        break;
                    }
                }
                // release whatever is still queued so frame hooks run
                while inner.queue.dequeue().is_some() {}
                if !failed {
                    if let Err(err) = stage.finish() {
                        log::error!("{}: finish: {}", std::thread::current().name().unwrap_or("worker"), err);
                        let mut slot = inner.failure.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            })
            .expect("spawning a worker thread cannot fail");
        Worker {
            shared,
            name: thread_name,
            thread: Some(thread),
        }
    }

    /// Hand a value to the worker. Never blocks; the value is dropped when
    /// the queue is full. Re-raises a pending worker failure instead.
    pub fn enqueue(&self, value: T) -> Result<()> {
        self.shared.enqueue(value)
    }

    pub fn handle(&self) -> WorkerHandle<T> {
        WorkerHandle(self.shared.clone())
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shared.queue.signal_eof();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
        if let Some(err) = self.shared.failure.lock().unwrap().take() {
            log::warn!("{} worker stopped with unreported failure: {}", self.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Collect {
        out: Arc<Mutex<Vec<u32>>>,
        fail_on: Option<u32>,
        finished: Arc<AtomicUsize>,
    }

    impl Stage for Collect {
        type Input = u32;

        fn process(&mut self, input: u32) -> Result<()> {
            if self.fail_on == Some(input) {
                return Err(AvError::Other(format!("injected failure on {input}")));
            }
            self.out.lock().unwrap().push(input);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn collect_stage(fail_on: Option<u32>) -> (Collect, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        (
            Collect {
                out: out.clone(),
                fail_on,
                finished: finished.clone(),
            },
            out,
            finished,
        )
    }

    #[test]
    fn processes_in_order_and_finishes_on_drop() {
        let (stage, out, finished) = collect_stage(None);
        let worker = Worker::spawn("test", 64, stage);
        for i in 0..32 {
            worker.enqueue(i).unwrap();
        }
        drop(worker);
        assert_eq!(*out.lock().unwrap(), (0..32).collect::<Vec<_>>());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_re_raises_on_next_enqueue_exactly_once() {
        let (stage, out, finished) = collect_stage(Some(3));
        let worker = Worker::spawn("test", 8, stage);
        // keep feeding until the stored failure comes back
        let mut raised = 0;
        for i in 0..100 {
            if worker.enqueue(i).is_err() {
                raised += 1;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(raised, 1);
        // after the re-raise, enqueue silently drops (queue is at EOF)
        worker.enqueue(999).unwrap();
        drop(worker);
        assert_eq!(*out.lock().unwrap(), vec![0, 1, 2]);
        // finish is skipped after a failure
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handle_feeds_worker_from_another_thread() {
        let (stage, out, _) = collect_stage(None);
        let worker = Worker::spawn("test", 64, stage);
        let handle = worker.handle();
        let feeder = std::thread::spawn(move || {
            for i in 0..16 {
                handle.enqueue(i).unwrap();
            }
        });
        feeder.join().unwrap();
        drop(worker);
        assert_eq!(*out.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn chained_workers_preserve_per_frame_order() {
        // stage one forwards into stage two through its handle, mirroring
        // how the scaler's callback feeds the encoder queue
        struct Forward {
            next: WorkerHandle<u32>,
        }
        impl Stage for Forward {
            type Input = u32;
            fn process(&mut self, input: u32) -> Result<()> {
                self.next.enqueue(input * 2)
            }
        }
        let (sink, out, _) = collect_stage(None);
        let second = Worker::spawn("second", 64, sink);
        let first = Worker::spawn("first", 64, Forward { next: second.handle() });
        for i in 0..32 {
            first.enqueue(i).unwrap();
        }
        drop(first);
        drop(second);
        let seen = out.lock().unwrap().clone();
        assert_eq!(seen, (0..32).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn queued_items_are_released_on_teardown() {
        struct Sluggish;
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl Stage for Sluggish {
            type Input = Counted;
            fn process(&mut self, input: Counted) -> Result<()> {
                std::thread::sleep(Duration::from_millis(20));
                drop(input);
                Ok(())
            }
        }
        let drops = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn("test", 4, Sluggish);
        for _ in 0..16 {
            worker.enqueue(Counted(drops.clone())).unwrap();
        }
        drop(worker);
        assert_eq!(drops.load(Ordering::SeqCst), 16);
    }
}
