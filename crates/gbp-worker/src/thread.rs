//! A background-thread backend: each [`Worker::run`] spawns a new
//! `std::thread` rather than blocking the caller.
//!
//! The original has no direct analogue to this (its RQ/Celery backends hand
//! off to an external process), but it's the natural "in-process async"
//! middle ground between [`crate::SyncWorker`] and a real external queue,
//! grounded on `shipper`'s thread-based parallel execution (`engine_parallel.rs`),
//! which likewise spawns a thread per unit of work over a shared `Arc`.

use std::sync::Arc;
use std::thread;

use gbp_core::Publisher;

use crate::{Error, SyncWorker, Task, Worker};

/// Spawns a thread per task, running it against a shared [`SyncWorker`]. In
/// `test_mode`, `run` blocks until the spawned thread finishes, so tests
/// observe the task's effects without a synchronization callback.
pub struct ThreadWorker {
    inner: Arc<SyncWorker>,
    test_mode: bool,
}

impl ThreadWorker {
    pub fn new(publisher: Arc<Publisher>, enable_purge: bool, test_mode: bool) -> Self {
        Self {
            inner: Arc::new(SyncWorker::new(publisher, enable_purge)),
            test_mode,
        }
    }
}

impl Worker for ThreadWorker {
    fn run(&self, task: Task) -> Result<(), Error> {
        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run(task));

        if !self.test_mode {
            return Ok(());
        }
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::ThreadPanic),
        }
    }
}
