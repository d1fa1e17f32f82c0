//! An external-queue backend: `run` enqueues rather than executes, and a
//! separate consumer (`QueueWorker::work`) pops and runs tasks, retrying
//! transient failures.
//!
//! Grounded on `jobs/rq.py`/`jobs/celery.py`, which enqueue the same task
//! functions onto RQ/Celery rather than running them inline, and on
//! `shipper-retry`'s retry-policy shape (bounded attempt count, terminal vs.
//! retryable error classes) for the re-enqueue-with-backoff behaviour.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{Error, Task, Worker, dispatch, is_retryable};
use gbp_core::Publisher;

/// A task plus how many times it has already been attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub task: Task,
    pub attempt: u32,
}

/// The external queue abstraction a [`QueueWorker`] enqueues onto and
/// drains from. A real deployment would back this with RQ/Celery/SQS/etc;
/// [`InMemoryQueue`] is a usable in-process implementation for single-node
/// deployments and tests.
pub trait Queue: Send + Sync {
    fn enqueue(&self, envelope: Envelope) -> Result<(), String>;
    fn dequeue(&self) -> Option<Envelope>;
}

/// A FIFO queue living entirely in process memory.
#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<Envelope>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Queue for InMemoryQueue {
    fn enqueue(&self, envelope: Envelope) -> Result<(), String> {
        self.items.lock().unwrap().push_back(envelope);
        Ok(())
    }

    fn dequeue(&self) -> Option<Envelope> {
        self.items.lock().unwrap().pop_front()
    }
}

/// Enqueues tasks onto a [`Queue`]; [`QueueWorker::work`] is the consumer
/// loop that actually runs them, retrying up to `max_attempts` times on a
/// retryable error ([`is_retryable`]) before giving up and logging.
pub struct QueueWorker<Q: Queue> {
    queue: Q,
    publisher: std::sync::Arc<Publisher>,
    enable_purge: bool,
    max_attempts: u32,
}

impl<Q: Queue> QueueWorker<Q> {
    pub fn new(
        queue: Q,
        publisher: std::sync::Arc<Publisher>,
        enable_purge: bool,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            publisher,
            enable_purge,
            max_attempts,
        }
    }

    /// Pop and run one envelope. Returns `false` if the queue was empty.
    pub fn work_once(&self) -> bool {
        let Some(envelope) = self.queue.dequeue() else {
            return false;
        };

        match dispatch(self, &self.publisher, self.enable_purge, envelope.task.clone()) {
            Ok(()) => {}
            Err(err) if is_retryable(&err) && envelope.attempt + 1 < self.max_attempts => {
                tracing::warn!(attempt = envelope.attempt, error = %err, "retrying task");
                let requeued = Envelope {
                    task: envelope.task,
                    attempt: envelope.attempt + 1,
                };
                if let Err(err) = self.queue.enqueue(requeued) {
                    tracing::error!(error = %err, "failed to requeue task");
                }
            }
            Err(err) => {
                tracing::error!(attempt = envelope.attempt, error = %err, "task failed permanently");
            }
        }
        true
    }

    /// Drain the queue, running [`QueueWorker::work_once`] until it's empty.
    /// A long-running consumer would instead poll; tests use this directly
    /// since [`InMemoryQueue`] never blocks.
    pub fn work(&self) {
        while self.work_once() {}
    }
}

impl<Q: Queue> Worker for QueueWorker<Q> {
    fn run(&self, task: Task) -> Result<(), Error> {
        self.queue
            .enqueue(Envelope { task, attempt: 0 })
            .map_err(Error::Queue)
    }
}
