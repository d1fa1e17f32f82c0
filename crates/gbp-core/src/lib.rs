//! The `Publisher` facade: the one object that knows how to take a CI
//! artifact through pull, publish, tag, delete and purge, dispatching named
//! events at each milestone.
//!
//! Grounded on `build_publisher.py`'s `BuildPublisher` class and
//! `publisher.py`'s `PublisherDispatcher`. Where the original reaches for a
//! module-level `publisher` singleton constructed from Django settings, this
//! version takes its collaborators (`CiClient`, `Storage`, `RecordDb`) by
//! explicit construction and holds no process-global state.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use gbp_ci::CiClient;
use gbp_dispatch::Dispatcher;
pub use gbp_dispatch::SubscriptionId;
use gbp_purge::Purger;
use gbp_records::RecordDb;
use gbp_storage::Storage;
use gbp_types::{Build, BuildRecord, GBPMetadata, Package};

pub mod apikey;
pub mod lock;
pub mod machine;

pub use lock::LockRegistry;
pub use machine::MachineInfo;

/// Errors a `Publisher` operation can fail with, wrapping every collaborator
/// crate's own error type.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error(transparent)]
    Storage(#[from] gbp_storage::Error),
    #[error(transparent)]
    Records(#[from] gbp_records::Error),
    #[error(transparent)]
    Ci(#[from] gbp_ci::Error),
    #[error(transparent)]
    Dispatch(#[from] gbp_dispatch::Error),
    #[error(transparent)]
    Machine(#[from] machine::Error),
    #[error("CI reported an out-of-range build timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Payload carried by each core [`gbp_dispatch::Dispatcher`] event a
/// `Publisher` emits.
#[derive(Debug, Clone)]
pub enum Event {
    Prepull(Build),
    Postpull {
        record: BuildRecord,
        packages: Vec<Package>,
        metadata: GBPMetadata,
    },
    Published(BuildRecord),
    Predelete(Build),
    Postdelete(Build),
    Tagged { build: Build, tag: String },
    Untagged { machine: String, tag: String },
}

/// Mirrors the original's `Status` enum (`REMOVED = -1, CHANGED = 0, ADDED =
/// 1`). [`Publisher::diff_binpkgs`] never actually produces `Changed`: cpvb
/// strings are unique per build, so a diff of two sorted sets reduces to
/// their symmetric difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Removed,
    Changed,
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub item: String,
    pub state: ChangeState,
}

/// The facade. One instance is shared across every worker in a process.
pub struct Publisher {
    ci: Arc<dyn CiClient>,
    storage: Storage,
    records: Arc<dyn RecordDb>,
    dispatcher: Mutex<Dispatcher<Event>>,
    locks: LockRegistry,
    gbp_hostname: String,
    gbp_version: String,
}

impl Publisher {
    pub fn new(
        ci: Arc<dyn CiClient>,
        storage: Storage,
        records: Arc<dyn RecordDb>,
        gbp_hostname: impl Into<String>,
        gbp_version: impl Into<String>,
    ) -> Self {
        Self {
            ci,
            storage,
            records,
            dispatcher: Mutex::new(Dispatcher::new()),
            locks: LockRegistry::new(),
            gbp_hostname: gbp_hostname.into(),
            gbp_version: gbp_version.into(),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn records(&self) -> &dyn RecordDb {
        self.records.as_ref()
    }

    /// Subscribe to a core or previously-registered event.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<SubscriptionId, PublisherError>
    where
        F: FnMut(&Event) -> Result<(), gbp_dispatch::BoxError> + Send + 'static,
    {
        Ok(self.dispatcher.lock().unwrap().subscribe(event, handler)?)
    }

    fn emit(&self, event: &str, payload: &Event) -> Result<(), PublisherError> {
        Ok(self.dispatcher.lock().unwrap().emit(event, payload)?)
    }

    /// The stored record for `build`, or an unsaved zero-valued one carrying
    /// only its identity.
    pub fn record(&self, build: &Build) -> BuildRecord {
        self.records
            .get(build)
            .unwrap_or_else(|_| BuildRecord::unsaved(build.clone()))
    }

    /// `Storage.Pulled(build) AND Record(build).completed != nil`.
    pub fn pulled(&self, build: &Build) -> bool {
        self.storage.pulled(build) && self.record(build).completed.is_some()
    }

    /// Pull `build`'s artifact, apply `tags`, and record CI metadata. Returns
    /// `false` without doing anything if already pulled.
    pub fn pull(
        &self,
        build: &Build,
        note: Option<String>,
        tags: &[String],
    ) -> Result<bool, PublisherError> {
        self.locks
            .with_build_lock(build, || self.pull_locked(build, note, tags))
    }

    fn pull_locked(
        &self,
        build: &Build,
        note: Option<String>,
        tags: &[String],
    ) -> Result<bool, PublisherError> {
        if self.pulled(build) {
            return Ok(false);
        }

        let mut record = self.record(build);
        if let Some(note) = note {
            record.note = Some(note);
        }
        let record = self.records.save(record)?;

        match self.pull_steps(build, record, tags) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.records.delete(build).ok();
                self.storage.delete(build).ok();
                Err(err)
            }
        }
    }

    fn pull_steps(
        &self,
        build: &Build,
        record: BuildRecord,
        tags: &[String],
    ) -> Result<(), PublisherError> {
        self.emit("prepull", &Event::Prepull(build.clone()))?;

        let previous = self.records.previous(&record, true)?;
        let artifact = self.ci.download_artifact(build)?;
        self.storage
            .extract_artifact(build, artifact, previous.as_ref().map(|r| &r.build))?;

        for tag in tags {
            self.storage.tag(build, tag)?;
        }

        let ci_metadata = self.ci.get_metadata(build)?;
        let logs = self.ci.get_logs(build)?;

        let built_secs = ci_metadata.timestamp_ms.div_euclid(1000);
        let built = chrono::DateTime::from_timestamp(built_secs, 0)
            .ok_or(PublisherError::InvalidTimestamp(built_secs))?;

        let mut record = record;
        record.built = Some(built);
        record.completed = Some(Utc::now());
        record.logs = Some(logs);
        let record = self.records.save(record)?;

        let packages = self.storage.get_packages(build)?;
        let gbp_metadata = GBPMetadata::compute(
            ci_metadata.duration_seconds,
            ci_metadata.timestamp_ms,
            &packages,
            &self.gbp_hostname,
            &self.gbp_version,
        );
        self.storage.set_metadata(build, &gbp_metadata)?;

        self.emit(
            "postpull",
            &Event::Postpull {
                record,
                packages,
                metadata: gbp_metadata,
            },
        )?;
        Ok(())
    }

    /// Publish `build`, pulling it first if necessary.
    pub fn publish(&self, build: &Build) -> Result<(), PublisherError> {
        self.locks
            .with_tag_lock(&build.machine, "", || self.publish_locked(build))
    }

    fn publish_locked(&self, build: &Build) -> Result<(), PublisherError> {
        if !self.pulled(build) {
            self.pull(build, None, &[])?;
        }
        self.storage.publish(build)?;
        let record = self.record(build);
        self.emit("published", &Event::Published(record))?;
        Ok(())
    }

    /// Apply tag `name` to `build`. Empty name is equivalent to [`Publisher::publish`].
    pub fn tag(&self, build: &Build, name: &str) -> Result<(), PublisherError> {
        if name.is_empty() {
            return self.publish(build);
        }
        self.locks.with_tag_lock(&build.machine, name, || {
            self.storage.tag(build, name)?;
            self.emit(
                "tagged",
                &Event::Tagged {
                    build: build.clone(),
                    tag: name.to_string(),
                },
            )?;
            Ok(())
        })
    }

    /// Remove tag `name` from `machine`.
    pub fn untag(&self, machine: &str, name: &str) -> Result<(), PublisherError> {
        self.locks.with_tag_lock(machine, name, || {
            self.storage.untag(machine, name)?;
            self.emit(
                "untagged",
                &Event::Untagged {
                    machine: machine.to_string(),
                    tag: name.to_string(),
                },
            )?;
            Ok(())
        })
    }

    /// `build`'s tags, excluding the empty/published one.
    pub fn tags(&self, build: &Build) -> Result<Vec<String>, PublisherError> {
        Ok(self.storage.get_tags(build, false)?)
    }

    /// Delete `build`'s record and storage. Best-effort: a missing record or
    /// missing storage tree is not an error.
    pub fn delete(&self, build: &Build) -> Result<(), PublisherError> {
        self.locks.with_delete_locks(build, || {
            self.emit("predelete", &Event::Predelete(build.clone()))?;
            self.records.delete(build)?;
            self.storage.delete(build)?;
            self.emit("postdelete", &Event::Postdelete(build.clone()))?;
            Ok(())
        })
    }

    /// Run the retention algorithm over `machine`'s builds and delete every
    /// candidate that is neither `keep`-flagged nor still tagged.
    pub fn purge(&self, machine: &str) -> Result<(), PublisherError> {
        let records = self.records.for_machine(machine)?;
        let purger = Purger::new(
            records,
            |r: &BuildRecord| r.submitted.map(|t| t.naive_utc()).unwrap_or_else(|| Utc::now().naive_utc()),
            Utc::now().naive_utc(),
        );

        for record in purger.purge() {
            if record.keep {
                continue;
            }
            if !self.storage.get_tags(&record.build, true)?.is_empty() {
                continue;
            }
            self.delete(&record.build)?;
        }
        Ok(())
    }

    /// Symmetric difference of `left` and `right`'s package `cpvb` sets.
    /// `Changed` entries never occur: `cpvb` strings are unique identifiers,
    /// so a line-diff of two sorted unique sets has no "modified" lines.
    pub fn diff_binpkgs(&self, left: &Build, right: &Build) -> Result<Vec<Change>, PublisherError> {
        if left == right {
            return Ok(Vec::new());
        }

        let left_set: BTreeSet<String> = self
            .storage
            .get_packages(left)?
            .iter()
            .map(Package::cpvb)
            .collect();
        let right_set: BTreeSet<String> = self
            .storage
            .get_packages(right)?
            .iter()
            .map(Package::cpvb)
            .collect();

        let mut changes: Vec<Change> = left_set
            .difference(&right_set)
            .map(|item| Change {
                item: item.clone(),
                state: ChangeState::Removed,
            })
            .chain(right_set.difference(&left_set).map(|item| Change {
                item: item.clone(),
                state: ChangeState::Added,
            }))
            .collect();
        changes.sort_by(|a, b| a.item.cmp(&b.item));
        Ok(changes)
    }

    /// Aggregate [`MachineInfo`] for every known machine, or only those named
    /// in `names` if given.
    pub fn machines(&self, names: Option<&[String]>) -> Result<Vec<MachineInfo>, PublisherError> {
        let all = self.records.list_machines()?;
        let selected: Vec<String> = match names {
            Some(names) => all.into_iter().filter(|m| names.contains(m)).collect(),
            None => all,
        };
        selected
            .into_iter()
            .map(|m| MachineInfo::new(m, self.records.as_ref(), &self.storage).map_err(PublisherError::from))
            .collect()
    }

    pub fn latest_build(
        &self,
        machine: &str,
        completed_only: bool,
    ) -> Result<Option<BuildRecord>, PublisherError> {
        Ok(self.records.latest(machine, completed_only)?)
    }

    pub fn search(
        &self,
        machine: &str,
        field: &str,
        key: &str,
    ) -> Result<Vec<BuildRecord>, PublisherError> {
        Ok(self.records.search(machine, field, key)?)
    }

    /// `build`'s `gbp.json`, or a value synthesised from its package index
    /// and record timestamps if none was ever written.
    pub fn build_metadata(&self, build: &Build) -> Result<GBPMetadata, PublisherError> {
        match self.storage.get_metadata(build) {
            Ok(metadata) => Ok(metadata),
            Err(gbp_storage::Error::LookupError { .. }) => {
                let packages = self.storage.get_packages(build).unwrap_or_default();
                let record = self.record(build);
                let duration = match (record.built, record.completed) {
                    (Some(built), Some(completed)) => (completed - built).num_seconds(),
                    _ => 0,
                };
                let ci_timestamp_ms = record.built.map(|b| b.timestamp_millis()).unwrap_or(0);
                Ok(GBPMetadata::compute(
                    duration,
                    ci_timestamp_ms,
                    &packages,
                    &self.gbp_hostname,
                    &self.gbp_version,
                ))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbp_ci::FakeCiClient;
    use gbp_ci::BuildMetadata as CiBuildMetadata;
    use gbp_records::MemoryRecordDb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn packages_tar(packages: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut index = String::new();
        for (i, cpv) in packages.iter().enumerate() {
            index.push_str(&format!(
                "\nCPV: {cpv}\nREPO: gentoo\nPATH: x\nBUILD_ID: 1\nSIZE: 10\nBUILD_TIME: {}\n",
                1_700_000_000 + i as i64
            ));
        }
        let files: &[(&str, &[u8])] = &[
            ("repos/gentoo/README", b"hi"),
            ("binpkgs/Packages", index.as_bytes()),
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

    fn publisher() -> (tempfile::TempDir, Publisher) {
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let publisher = Publisher::new(
            Arc::new(FakeCiClient::new()),
            storage,
            Arc::new(MemoryRecordDb::new()),
            "builder",
            "0.1.0",
        );
        (td, publisher)
    }

    #[test]
    fn pull_downloads_extracts_and_records_metadata() {
        let (_td, publisher) = publisher();
        let ci_client = FakeCiClient::new();
        let build = Build::new("babette", "1").unwrap();
        ci_client.with_artifact(&build, packages_tar(&["app-arch/unzip-6.0_p26"]));
        ci_client.with_logs(&build, "ok");
        ci_client.with_metadata(
            &build,
            CiBuildMetadata {
                duration_seconds: 30,
                timestamp_ms: 1_700_000_000_000,
            },
        );
        let storage = Storage::new(tempdir().unwrap().path().to_path_buf());
        storage.init().unwrap();
        let publisher = Publisher::new(
            Arc::new(ci_client),
            storage,
            Arc::new(MemoryRecordDb::new()),
            "builder",
            "0.1.0",
        );

        assert!(publisher.pull(&build, Some("note".into()), &[]).unwrap());
        assert!(publisher.pulled(&build));

        let record = publisher.record(&build);
        assert_eq!(record.note.as_deref(), Some("note"));
        assert!(record.completed.is_some());

        let metadata = publisher.build_metadata(&build).unwrap();
        assert_eq!(metadata.packages.total, 1);

        // Idempotent: a second pull is a no-op.
        assert!(!publisher.pull(&build, None, &[]).unwrap());
    }

    #[test]
    fn pull_applies_tags() {
        let ci_client = FakeCiClient::new();
        let build = Build::new("babette", "2").unwrap();
        ci_client.with_artifact(&build, packages_tar(&[]));
        ci_client.with_logs(&build, "");
        ci_client.with_metadata(
            &build,
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

        publisher
            .pull(&build, None, &["stable".to_string()])
            .unwrap();
        assert_eq!(publisher.tags(&build).unwrap(), vec!["stable".to_string()]);
    }

    #[test]
    fn publish_pulls_first_then_publishes_and_emits() {
        let ci_client = FakeCiClient::new();
        let build = Build::new("babette", "1").unwrap();
        ci_client.with_artifact(&build, packages_tar(&[]));
        ci_client.with_logs(&build, "");
        ci_client.with_metadata(
            &build,
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

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        publisher
            .subscribe("published", move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        publisher.publish(&build).unwrap();
        assert!(publisher.storage().published(&build));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_removes_record_and_storage_and_is_idempotent() {
        let ci_client = FakeCiClient::new();
        let build = Build::new("babette", "1").unwrap();
        ci_client.with_artifact(&build, packages_tar(&[]));
        ci_client.with_logs(&build, "");
        ci_client.with_metadata(
            &build,
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

        publisher.pull(&build, None, &[]).unwrap();
        publisher.delete(&build).unwrap();
        assert!(!publisher.pulled(&build));
        // Deleting again must not error (best-effort semantics).
        publisher.delete(&build).unwrap();
    }

    #[test]
    fn diff_binpkgs_is_empty_for_the_same_build() {
        let (_td, publisher) = publisher();
        let build = Build::new("babette", "1").unwrap();
        assert_eq!(publisher.diff_binpkgs(&build, &build).unwrap(), Vec::new());
    }

    #[test]
    fn diff_binpkgs_reports_symmetric_difference() {
        let ci_client = FakeCiClient::new();
        let left = Build::new("babette", "1").unwrap();
        let right = Build::new("babette", "2").unwrap();
        ci_client.with_artifact(&left, packages_tar(&["app-arch/unzip-6.0_p26", "acct-group/sgx-0"]));
        ci_client.with_artifact(&right, packages_tar(&["app-arch/unzip-6.0_p26", "dev-lang/rust-1.0"]));
        for b in [&left, &right] {
            ci_client.with_logs(b, "");
            ci_client.with_metadata(
                b,
                CiBuildMetadata {
                    duration_seconds: 1,
                    timestamp_ms: 1_700_000_000_000,
                },
            );
        }
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
        publisher.pull(&left, None, &[]).unwrap();
        publisher.pull(&right, None, &[]).unwrap();

        let changes = publisher.diff_binpkgs(&left, &right).unwrap();
        assert!(changes.iter().all(|c| c.state != ChangeState::Changed));
        assert!(changes.iter().any(|c| c.item.contains("sgx") && c.state == ChangeState::Removed));
        assert!(changes.iter().any(|c| c.item.contains("rust") && c.state == ChangeState::Added));
        assert!(!changes.iter().any(|c| c.item.contains("unzip")));
    }

    #[test]
    fn record_of_unknown_build_is_unsaved() {
        let (_td, publisher) = publisher();
        let build = Build::new("babette", "1").unwrap();
        let record = publisher.record(&build);
        assert!(!record.keep);
        assert!(record.completed.is_none());
    }
}
