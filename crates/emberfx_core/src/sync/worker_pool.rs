//! # Worker Pool
//!
//! A fixed set of persistent threads draining a shared task queue, with a
//! synchronous barrier join for the frame thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// A unit of work submitted to the pool.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Barrier state shared between the frame thread and the workers.
struct InFlight {
    /// Number of submitted tasks that have not finished executing.
    count: Mutex<usize>,
    /// Signaled whenever the count returns to zero.
    drained: Condvar,
}

/// A fixed-size pool of persistent worker threads.
///
/// The contract is fork-join shaped: the frame thread pushes a batch of
/// tasks, then blocks on [`wait_all`](Self::wait_all). `wait_all` returns
/// only after every task pushed before the call has completed. There is no
/// total ordering across tasks and no cancellation - tasks are bounded by
/// construction and run to completion.
///
/// # Panic Policy
///
/// A panicking task is contained with `catch_unwind`, counted, and logged;
/// the worker thread survives. Leaving a persistent worker to die on the
/// first bad task is not acceptable for a pool that lives as long as the
/// process.
///
/// # Shutdown
///
/// Dropping the pool closes the queue. Idle workers observe the closed
/// queue and exit; the drop joins every thread. Tasks cannot be pushed
/// after shutdown begins because pushing requires the pool by reference.
pub struct WorkerPool {
    /// Queue producer; taken (closed) on drop.
    sender: Option<Sender<Task>>,
    /// Worker join handles, drained on drop.
    workers: Vec<JoinHandle<()>>,
    /// Barrier state.
    in_flight: Arc<InFlight>,
    /// Monotonic count of tasks ever pushed.
    submitted: AtomicU64,
    /// Monotonic count of tasks that finished executing.
    completed: Arc<AtomicU64>,
    /// Count of tasks that panicked.
    panicked: Arc<AtomicU64>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("panicked", &self.panicked.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool of `thread_count` persistent workers.
    ///
    /// # Arguments
    ///
    /// * `thread_count` - Number of worker threads to spawn
    ///
    /// # Panics
    ///
    /// Panics if `thread_count` is zero or a worker thread cannot be
    /// spawned.
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0, "worker pool needs at least one thread");

        let (sender, receiver) = unbounded::<Task>();
        let in_flight = Arc::new(InFlight {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });
        let completed = Arc::new(AtomicU64::new(0));
        let panicked = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let completed = Arc::clone(&completed);
            let panicked = Arc::clone(&panicked);

            let handle = std::thread::Builder::new()
                .name(format!("emberfx-worker-{index}"))
                .spawn(move || worker_loop(&receiver, &in_flight, &completed, &panicked))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        tracing::debug!(thread_count, "worker pool started");

        Self {
            sender: Some(sender),
            workers,
            in_flight,
            submitted: AtomicU64::new(0),
            completed,
            panicked,
        }
    }

    /// Pushes one task onto the shared queue and wakes a worker.
    ///
    /// The in-flight counter is raised before the task becomes visible to
    /// workers, so a later [`wait_all`](Self::wait_all) cannot miss it.
    pub fn push_task(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut count = self.in_flight.count.lock();
            *count += 1;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let Some(sender) = self.sender.as_ref() else {
            // Unreachable while the pool is alive; keep the counter honest.
            let mut count = self.in_flight.count.lock();
            *count -= 1;
            if *count == 0 {
                self.in_flight.drained.notify_all();
            }
            return;
        };
        if sender.send(Box::new(task)).is_err() {
            tracing::error!("task queue closed while pool still alive");
            let mut count = self.in_flight.count.lock();
            *count -= 1;
            if *count == 0 {
                self.in_flight.drained.notify_all();
            }
        }
    }

    /// Blocks until every task pushed before this call has completed.
    ///
    /// Only the pushing side of the current fan-out may race with this
    /// call; unrelated producers pushing concurrently would extend the
    /// wait, and the scheduler never nests fan-outs.
    pub fn wait_all(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.drained.wait(&mut count);
        }
    }

    /// Returns the number of worker threads.
    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Returns the total number of tasks ever pushed.
    ///
    /// Test instrumentation: lets callers verify that a sync code path
    /// submitted no work.
    #[inline]
    #[must_use]
    pub fn submitted_tasks(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Returns the total number of tasks that finished executing.
    #[inline]
    #[must_use]
    pub fn completed_tasks(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of tasks that panicked and were contained.
    #[inline]
    #[must_use]
    pub fn panicked_tasks(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue wakes every idle worker with a disconnect.
        drop(self.sender.take());

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
    }
}

/// Body of one worker thread: drain tasks until the queue closes.
fn worker_loop(
    receiver: &Receiver<Task>,
    in_flight: &InFlight,
    completed: &AtomicU64,
    panicked: &AtomicU64,
) {
    while let Ok(task) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("worker task panicked; worker continues");
        }
        completed.fetch_add(1, Ordering::Relaxed);

        let mut count = in_flight.count.lock();
        *count -= 1;
        if *count == 0 {
            in_flight.drained.notify_all();
        }
    }
}
