//! Task execution for [`gbp_core::Publisher`] operations, pluggable across
//! three backends.
//!
//! Grounded on `jobs/__init__.py`'s `JobsInterface` protocol and task
//! functions (`pull_build`, `publish_build`, `purge_machine`,
//! `delete_build`), and its three concrete backends `jobs/sync.py`,
//! `jobs/rq.py`, `jobs/celery.py`: sync runs a task in the caller; RQ and
//! Celery both just enqueue the same task logic onto an external queue.
//! [`SyncWorker`] and [`ThreadWorker`]/[`QueueWorker`] mirror that split.
//!
//! A successful `PullBuild` enqueues a follow-up `PurgeMachine` when the
//! worker is configured with `enable_purge`, matching
//! `BUILD_PUBLISHER_ENABLE_PURGE` in the original.

use std::str::FromStr;
use std::sync::Arc;

use gbp_core::{Publisher, PublisherError};
use gbp_types::Build;

pub mod queue;
pub mod thread;

pub use queue::QueueWorker;
pub use thread::ThreadWorker;

/// One unit of background work. The four standard tasks from the original's
/// `jobs` module; a backend's `run` (or `enqueue`) accepts any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    PullBuild {
        build_id: String,
        note: Option<String>,
        tags: Vec<String>,
    },
    PublishBuild {
        build_id: String,
    },
    PurgeMachine {
        machine: String,
    },
    DeleteBuild {
        build_id: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid build id: {0:?}")]
    InvalidBuild(String),
    #[error(transparent)]
    Publisher(#[from] PublisherError),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("worker thread panicked")]
    ThreadPanic,
}

/// Whether `err` belongs to the fixed set of retryable transport errors
/// (connection reset, EOF, generic HTTP error) rather than a terminal one
/// like CI 404, per §4.9: only CI-sourced failures are ever retried, and a
/// 404 specifically is never retried since it means the artifact is gone.
pub fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::Publisher(PublisherError::Ci(ci_err)) if !matches!(ci_err, gbp_ci::Error::NotFound)
    )
}

fn parse_build(build_id: &str) -> Result<Build, Error> {
    Build::from_str(build_id).map_err(|_| Error::InvalidBuild(build_id.to_string()))
}

/// Accepts a [`Task`] for execution. `run` either executes immediately
/// ([`SyncWorker`], [`ThreadWorker`]) or enqueues for later consumption
/// ([`QueueWorker`]).
pub trait Worker: Send + Sync {
    fn run(&self, task: Task) -> Result<(), Error>;
}

/// Runs `task` against `publisher`, recursing into `worker` for any
/// follow-up task it schedules (currently only `PullBuild`'s
/// `PurgeMachine` enqueue). Shared by every backend so the task semantics
/// live in exactly one place.
pub fn dispatch(
    worker: &dyn Worker,
    publisher: &Publisher,
    enable_purge: bool,
    task: Task,
) -> Result<(), Error> {
    match task {
        Task::PullBuild {
            build_id,
            note,
            tags,
        } => {
            pull_build(publisher, &build_id, note, &tags)?;
            if enable_purge {
                let build = parse_build(&build_id)?;
                worker.run(Task::PurgeMachine {
                    machine: build.machine,
                })?;
            }
            Ok(())
        }
        Task::PublishBuild { build_id } => publish_build(publisher, &build_id),
        Task::PurgeMachine { machine } => purge_machine(publisher, &machine),
        Task::DeleteBuild { build_id } => delete_build(publisher, &build_id),
    }
}

/// Download and extract `build_id`'s artifact. On failure, the build is
/// logged and its partial record/storage are deleted (mirroring
/// `Publisher::pull`'s own cleanup, so this is mostly a thin parse+log
/// wrapper, but matches the original's task-level try/except too).
pub fn pull_build(
    publisher: &Publisher,
    build_id: &str,
    note: Option<String>,
    tags: &[String],
) -> Result<(), Error> {
    let build = parse_build(build_id)?;
    match publisher.pull(&build, note, tags) {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::error!(build = %build, error = %err, "pull_build failed");
            Err(err.into())
        }
    }
}

/// Pull (if needed) then publish. An HTTP-status error during the pull is
/// logged and swallowed rather than propagated, matching
/// `jobs.publish_build`'s `except requests.HTTPError` clause: the build
/// simply stays unpublished. A connection-level transport error (refused,
/// DNS, timeout — no response was ever received) is *not* in
/// `PUBLISH_FATAL_EXCEPTIONS` and propagates, so the queue backend can
/// retry it.
pub fn publish_build(publisher: &Publisher, build_id: &str) -> Result<(), Error> {
    let build = parse_build(build_id)?;
    match publisher.pull(&build, None, &[]) {
        Ok(_) => {}
        Err(err @ PublisherError::Ci(gbp_ci::Error::NotFound | gbp_ci::Error::HttpStatus(_))) => {
            tracing::error!(build = %build, error = %err, "publish_build: pull failed, not publishing");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }
    publisher.publish(&build)?;
    Ok(())
}

pub fn purge_machine(publisher: &Publisher, machine: &str) -> Result<(), Error> {
    publisher.purge(machine)?;
    Ok(())
}

pub fn delete_build(publisher: &Publisher, build_id: &str) -> Result<(), Error> {
    let build = parse_build(build_id)?;
    publisher.delete(&build)?;
    Ok(())
}

/// Runs every task in the caller's own thread, synchronously. Mirrors
/// `jobs/sync.py`, which just calls the task functions directly.
pub struct SyncWorker {
    publisher: Arc<Publisher>,
    enable_purge: bool,
}

impl SyncWorker {
    pub fn new(publisher: Arc<Publisher>, enable_purge: bool) -> Self {
        Self {
            publisher,
            enable_purge,
        }
    }
}

impl Worker for SyncWorker {
    fn run(&self, task: Task) -> Result<(), Error> {
        dispatch(self, &self.publisher, self.enable_purge, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbp_ci::{BuildMetadata as CiBuildMetadata, FakeCiClient};
    use gbp_records::MemoryRecordDb;
    use gbp_storage::Storage;
    use tempfile::tempdir;

    fn packages_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let files: &[(&str, &[u8])] = &[
            ("repos/gentoo/README", b"hi"),
            ("binpkgs/Packages", b""),
            ("etc-portage/make.conf", b""),
            ("var-lib-portage/world", b""),
        ];
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn publisher_with_build(build: &Build) -> (tempfile::TempDir, Publisher) {
        let ci_client = FakeCiClient::new();
        ci_client.with_artifact(build, packages_tar());
        ci_client.with_logs(build, "ok");
        ci_client.with_metadata(
            build,
            CiBuildMetadata {
                duration_seconds: 1,
                timestamp_ms: 1_700_000_000_000,
            },
        );
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let publisher = Publisher::new(
            Arc::new(ci_client),
            storage,
            Arc::new(MemoryRecordDb::new()),
            "builder",
            "0.1.0",
        );
        (td, publisher)
    }

    #[test]
    fn sync_worker_pulls_a_build() {
        let build = Build::new("babette", "1").unwrap();
        let (_td, publisher) = publisher_with_build(&build);
        let publisher = Arc::new(publisher);
        let worker = SyncWorker::new(publisher.clone(), false);

        worker
            .run(Task::PullBuild {
                build_id: build.to_string(),
                note: None,
                tags: vec![],
            })
            .unwrap();

        assert!(publisher.pulled(&build));
    }

    #[test]
    fn sync_worker_publish_build_pulls_then_publishes() {
        let build = Build::new("babette", "1").unwrap();
        let (_td, publisher) = publisher_with_build(&build);
        let publisher = Arc::new(publisher);
        let worker = SyncWorker::new(publisher.clone(), false);

        worker
            .run(Task::PublishBuild {
                build_id: build.to_string(),
            })
            .unwrap();

        assert!(publisher.storage().published(&build));
    }

    #[test]
    fn pull_build_rejects_a_malformed_build_id() {
        let build = Build::new("babette", "1").unwrap();
        let (_td, publisher) = publisher_with_build(&build);
        let publisher = Arc::new(publisher);
        let worker = SyncWorker::new(publisher, false);

        let err = worker
            .run(Task::PullBuild {
                build_id: "not-a-build".to_string(),
                note: None,
                tags: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBuild(_)));
    }

    /// A [`gbp_ci::CiClient`] that fails every call with a connection-level
    /// transport error (no response ever received), to exercise the branch
    /// `publish_build` must *not* swallow.
    #[derive(Default)]
    struct UnreachableCiClient;

    impl gbp_ci::CiClient for UnreachableCiClient {
        fn download_artifact(
            &self,
            _build: &Build,
        ) -> Result<Box<dyn std::io::Read + Send>, gbp_ci::Error> {
            Err(gbp_ci::Error::Transport("connection refused".to_string()))
        }

        fn get_logs(&self, _build: &Build) -> Result<String, gbp_ci::Error> {
            Err(gbp_ci::Error::Transport("connection refused".to_string()))
        }

        fn get_metadata(&self, _build: &Build) -> Result<CiBuildMetadata, gbp_ci::Error> {
            Err(gbp_ci::Error::Transport("connection refused".to_string()))
        }

        fn schedule_build(
            &self,
            _machine: &str,
            _params: &std::collections::HashMap<String, String>,
        ) -> Result<Option<String>, gbp_ci::Error> {
            Err(gbp_ci::Error::Transport("connection refused".to_string()))
        }
    }

    #[test]
    fn publish_build_propagates_a_connection_level_transport_error() {
        let build = Build::new("babette", "1").unwrap();
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let publisher = Arc::new(Publisher::new(
            Arc::new(UnreachableCiClient),
            storage,
            Arc::new(MemoryRecordDb::new()),
            "builder",
            "0.1.0",
        ));
        let worker = SyncWorker::new(publisher, false);

        let err = worker
            .run(Task::PublishBuild {
                build_id: build.to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Publisher(PublisherError::Ci(gbp_ci::Error::Transport(_)))
        ));
    }

    #[test]
    fn publish_build_swallows_a_ci_failure_on_pull() {
        let build = Build::new("babette", "missing").unwrap();
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let publisher = Arc::new(Publisher::new(
            Arc::new(FakeCiClient::new()),
            storage,
            Arc::new(MemoryRecordDb::new()),
            "builder",
            "0.1.0",
        ));
        let worker = SyncWorker::new(publisher.clone(), false);

        worker
            .run(Task::PublishBuild {
                build_id: build.to_string(),
            })
            .expect("CI errors are swallowed, not propagated");
        assert!(!publisher.storage().published(&build));
    }

    #[test]
    fn enable_purge_enqueues_purge_machine_after_a_successful_pull() {
        let build = Build::new("babette", "1").unwrap();
        let (_td, publisher) = publisher_with_build(&build);
        let publisher = Arc::new(publisher);
        let worker = SyncWorker::new(publisher.clone(), true);

        // Purge with no other builds on the machine is a no-op, but it
        // must not error: this exercises that the follow-up task actually runs.
        worker
            .run(Task::PullBuild {
                build_id: build.to_string(),
                note: None,
                tags: vec![],
            })
            .unwrap();
    }

    #[test]
    fn delete_build_then_purge_machine_are_best_effort() {
        let build = Build::new("babette", "1").unwrap();
        let (_td, publisher) = publisher_with_build(&build);
        let publisher = Arc::new(publisher);
        let worker = SyncWorker::new(publisher.clone(), false);
        worker
            .run(Task::PullBuild {
                build_id: build.to_string(),
                note: None,
                tags: vec![],
            })
            .unwrap();

        worker
            .run(Task::DeleteBuild {
                build_id: build.to_string(),
            })
            .unwrap();
        assert!(!publisher.pulled(&build));

        worker
            .run(Task::PurgeMachine {
                machine: "babette".to_string(),
            })
            .unwrap();
    }
}
