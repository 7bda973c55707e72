#![forbid(unsafe_code)]

//! The serial worker: a single named thread draining a FIFO job channel.
//!
//! All listener-index mutations and all rewrite computations run here.
//! Serial ordering is the sole concurrency-control mechanism for those
//! structures — the worker owns the index outright and no lock exists.
//!
//! Once enqueued, a job runs to completion; there is no cancellation.
//! Shutdown is an explicit sentinel message followed by a join, so jobs
//! already queued still run before the thread exits.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::index::ListenerIndex;

/// A unit of serial work. Jobs receive exclusive access to the index.
pub(crate) type Job = Box<dyn FnOnce(&mut ListenerIndex) + Send + 'static>;

enum WorkMsg {
    Run(Job),
    Shutdown,
}

/// Cloneable submit-only handle, for components that outlive no one but
/// still need to enqueue (the GC timer).
#[derive(Clone)]
pub(crate) struct WorkHandle {
    tx: mpsc::Sender<WorkMsg>,
}

impl WorkHandle {
    /// Enqueue a job; silently dropped after shutdown.
    pub fn submit(&self, job: Job) {
        let _ = self.tx.send(WorkMsg::Run(job));
    }
}

/// Handle to the serial worker thread.
pub(crate) struct WorkQueue {
    tx: mpsc::Sender<WorkMsg>,
    handle: Option<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn the worker. The thread owns the [`ListenerIndex`] for its
    /// whole life.
    pub fn start(thread_name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkMsg>();
        let handle = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || work_loop(rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Enqueue a job. After shutdown this silently drops the job, which
    /// matches the "work against a dead engine is a no-op" contract.
    pub fn submit(&self, job: Job) {
        let _ = self.tx.send(WorkMsg::Run(job));
    }

    /// A detached handle for submitting from other threads.
    pub fn handle(&self) -> WorkHandle {
        WorkHandle {
            tx: self.tx.clone(),
        }
    }

    /// Ask the worker to exit after draining queued jobs, then join it.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(WorkMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work_loop(rx: mpsc::Receiver<WorkMsg>) {
    let mut index = ListenerIndex::new();
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkMsg::Run(job) => job(&mut index),
            WorkMsg::Shutdown => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    fn barrier(queue: &WorkQueue) {
        let (tx, rx) = channel();
        queue.submit(Box::new(move |_| {
            let _ = tx.send(());
        }));
        rx.recv().unwrap();
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = WorkQueue::start("test-worker").unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            queue.submit(Box::new(move |_| log.lock().unwrap().push(i)));
        }
        barrier(&queue);
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn jobs_see_the_same_index() {
        let queue = WorkQueue::start("test-worker").unwrap();
        let observer = crate::testing::RecordingObserver::with_root(crate::testing::leaf("a", 0));
        let o: Arc<dyn crate::observer::Observer> = observer.clone();

        let o2 = o.clone();
        queue.submit(Box::new(move |index| {
            index.add(crate::model::ModelId::from("a"), &o2);
        }));
        let (tx, rx) = channel();
        queue.submit(Box::new(move |index| {
            let _ = tx.send(index.observers_for(&crate::model::ModelId::from("a")).len());
        }));
        assert_eq!(rx.recv().unwrap(), 1);
        drop(o);
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let mut queue = WorkQueue::start("test-worker").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = Arc::clone(&hits);
            queue.submit(Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn submit_after_shutdown_is_a_noop() {
        let mut queue = WorkQueue::start("test-worker").unwrap();
        queue.shutdown();
        // Must neither panic nor deadlock.
        queue.submit(Box::new(|_| {}));
    }
}
