//! `RecordDB`: CRUD and ordered queries over [`BuildRecord`]s, with two
//! interchangeable backends.
//!
//! Ordering contract (`for_machine`): `built` descending, nulls last, then
//! `submitted` descending — per the design's resolution of an ambiguity in
//! the original implementation, which instead falls back to `build_id`
//! ordering; see `DESIGN.md`.

use chrono::{DateTime, Utc};
use gbp_types::{Build, BuildRecord};

pub mod memory;
pub mod sql;

pub use memory::MemoryRecordDb;
pub use sql::SqlRecordDb;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("record not found: {0}")]
    NotFound(Build),
    #[error("field {0:?} is not searchable")]
    NotSearchable(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Which free-text field [`RecordDb::search`] matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Logs,
    Note,
}

impl SearchField {
    pub fn parse(field: &str) -> Result<Self, Error> {
        match field {
            "logs" => Ok(SearchField::Logs),
            "note" => Ok(SearchField::Note),
            other => Err(Error::NotSearchable(other.to_string())),
        }
    }
}

/// Persistence and query contract for [`BuildRecord`]s. Both backends in
/// this crate, and any future one, must satisfy the same ordering and
/// upsert semantics — see [`memory::tests`] and [`sql::tests`], which each
/// assert the same set of properties against their own backend.
pub trait RecordDb: Send + Sync {
    /// Upsert `record`. If `submitted` is `None`, it's set to `now` first.
    /// Returns the stored record.
    fn save(&self, record: BuildRecord) -> Result<BuildRecord, Error>;
    fn get(&self, build: &Build) -> Result<BuildRecord, Error>;
    fn exists(&self, build: &Build) -> bool;
    fn delete(&self, build: &Build) -> Result<(), Error>;
    /// Ordered by `built` descending (nulls last), then `submitted` descending.
    fn for_machine(&self, machine: &str) -> Result<Vec<BuildRecord>, Error>;
    fn previous(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error>;
    fn next(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error>;
    /// Greatest `built` among matching records; if none have `built`, falls
    /// back to the greatest `build_id` (legacy tie-break, see `DESIGN.md`).
    fn latest(&self, machine: &str, completed_only: bool) -> Result<Option<BuildRecord>, Error>;
    fn list_machines(&self) -> Result<Vec<String>, Error>;
    fn search(&self, machine: &str, field: &str, key: &str) -> Result<Vec<BuildRecord>, Error>;
    fn count(&self, machine: Option<&str>) -> Result<usize, Error>;
}

/// Shared helper: apply `save`'s "set submitted if absent" rule.
pub(crate) fn with_submitted_default(mut record: BuildRecord, now: DateTime<Utc>) -> BuildRecord {
    if record.submitted.is_none() {
        record.submitted = Some(now);
    }
    record
}

/// Shared helper: the `for_machine` sort order, applied by both backends.
pub(crate) fn sort_for_machine(records: &mut [BuildRecord]) {
    records.sort_by(|a, b| {
        let built = b.built.cmp(&a.built);
        if built != std::cmp::Ordering::Equal {
            return built;
        }
        b.submitted.cmp(&a.submitted)
    });
}

/// Shared helper: the legacy `Latest` fallback when no candidate has `built`.
pub(crate) fn pick_latest_by_build_id<'a>(
    records: impl Iterator<Item = &'a BuildRecord>,
) -> Option<&'a BuildRecord> {
    records.max_by(|a, b| a.build.build_id_sort_key().cmp(&b.build.build_id_sort_key()))
}

#[cfg(test)]
mod contract_tests {
    //! The same property checks run against both backends in their own
    //! `tests` modules; this module holds the shared fixtures used there.
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn record(machine: &str, id: &str, built_hour: Option<u32>) -> BuildRecord {
        let mut r = BuildRecord::unsaved(Build::new(machine, id).unwrap());
        r.built = built_hour.map(|h| Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap());
        r
    }

    #[test]
    fn sort_for_machine_orders_built_desc_nulls_last_then_submitted_desc() {
        let mut records = vec![
            record("m", "1", Some(1)),
            record("m", "2", Some(3)),
            record("m", "3", None),
        ];
        sort_for_machine(&mut records);
        assert_eq!(records[0].build.build_id, "2");
        assert_eq!(records[1].build.build_id, "1");
        assert_eq!(records[2].build.build_id, "3");
    }
}
