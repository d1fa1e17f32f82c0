//! Per-machine aggregate view, grounded on `machines.py`'s `MachineInfo`.
//!
//! The original computes each field lazily via `@cached_property`, memoised
//! on first access against a module-level `publisher` singleton. There is no
//! such singleton here and no reason to defer: everything `MachineInfo` needs
//! is already in hand at construction time, so every field is computed once,
//! eagerly, in [`MachineInfo::new`].

use gbp_records::RecordDb;
use gbp_storage::Storage;
use gbp_types::{Build, BuildRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Records(#[from] gbp_records::Error),
    #[error(transparent)]
    Storage(#[from] gbp_storage::Error),
}

/// A snapshot of everything known about one machine's builds.
#[derive(Debug, Clone)]
pub struct MachineInfo {
    pub machine: String,
    pub build_count: usize,
    pub builds: Vec<BuildRecord>,
    pub latest_build: Option<BuildRecord>,
    pub published_build: Option<Build>,
    pub tags: Vec<String>,
}

impl MachineInfo {
    /// Gather `machine`'s builds (already `built` descending, per
    /// [`RecordDb::for_machine`]) and derive every summary field from them.
    pub fn new(
        machine: impl Into<String>,
        records: &dyn RecordDb,
        storage: &Storage,
    ) -> Result<Self, Error> {
        let machine = machine.into();
        let builds = records.for_machine(&machine)?;
        let build_count = builds.len();

        let latest_build = builds.iter().find(|b| b.completed.is_some()).cloned();

        let published_build = builds
            .iter()
            .find(|b| storage.published(&b.build))
            .map(|b| b.build.clone());

        let mut tags = Vec::new();
        for build in &builds {
            tags.extend(storage.get_tags(&build.build, false)?);
        }
        tags.sort();
        tags.dedup();

        Ok(Self {
            machine,
            build_count,
            builds,
            latest_build,
            published_build,
            tags,
        })
    }
}
