#![forbid(unsafe_code)]

//! Crossing from worker execution to delivery-context callbacks.
//!
//! The engine never calls an observer from its worker thread directly;
//! every externally observable callback goes through a
//! [`DeliveryScheduler`]. The scheduler is the portable stand-in for
//! "the main thread": hosts with a UI loop hand the engine a scheduler
//! that enqueues onto that loop, tests and headless hosts use
//! [`InlineScheduler`].
//!
//! # Ordering
//!
//! A scheduler must run tasks FIFO. The engine relies on this for
//! delivery ordering; it provides no reordering guarantees beyond it.

use std::sync::mpsc;
use std::sync::Mutex;

/// A unit of delivery work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO executor for observer callbacks, delegate notifications, and
/// pause-table mutations.
pub trait DeliveryScheduler: Send + Sync + 'static {
    /// Enqueue `task`. Must not block on the task's completion.
    fn dispatch(&self, task: Task);
}

/// Runs each task immediately on the calling thread.
///
/// With this scheduler, worker-side dispatches execute observer
/// callbacks on the worker thread; callers that need affinity to a
/// particular thread should use [`QueueScheduler`] instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl DeliveryScheduler for InlineScheduler {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Unbounded FIFO queue pumped by the host.
///
/// The host thread that owns deliveries calls [`QueueScheduler::run_pending`]
/// from its loop. Tasks enqueued while the host is not pumping simply
/// wait; nothing is dropped until the scheduler itself is dropped.
pub struct QueueScheduler {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueScheduler {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Run every task currently queued, in FIFO order. Returns the number
    /// of tasks run. Tasks enqueued *by* a running task are picked up in
    /// the same call.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Release the receiver lock before running the task so tasks
            // may dispatch follow-ups onto this same scheduler.
            let task = match self.rx.lock() {
                Ok(rx) => rx.try_recv().ok(),
                Err(_) => None,
            };
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl DeliveryScheduler for QueueScheduler {
    fn dispatch(&self, task: Task) {
        // Send fails only when the receiver half is gone, which means the
        // scheduler is being torn down; dropping the task is correct then.
        let _ = self.tx.send(task);
    }
}

/// Dispatch `f` and block until it has run, returning its result.
///
/// `None` means the scheduler dropped the task (teardown); callers treat
/// that as "skip the work".
pub(crate) fn run_sync<R, F>(scheduler: &dyn DeliveryScheduler, f: F) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    scheduler.dispatch(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx.recv().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
