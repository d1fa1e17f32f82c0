//! In-memory `RecordDb`, for tests and the `memory` backend setting.

use std::sync::Mutex;

use chrono::Utc;
use gbp_types::{Build, BuildRecord};

use crate::{Error, RecordDb, pick_latest_by_build_id, sort_for_machine, with_submitted_default};

#[derive(Default)]
pub struct MemoryRecordDb {
    records: Mutex<Vec<BuildRecord>>,
}

impl MemoryRecordDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordDb for MemoryRecordDb {
    fn save(&self, record: BuildRecord) -> Result<BuildRecord, Error> {
        let record = with_submitted_default(record, Utc::now());
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter_mut().find(|r| r.build == record.build) {
            *existing = record.clone();
        } else {
            records.push(record.clone());
        }
        Ok(record)
    }

    fn get(&self, build: &Build) -> Result<BuildRecord, Error> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.build == build)
            .cloned()
            .ok_or_else(|| Error::NotFound(build.clone()))
    }

    fn exists(&self, build: &Build) -> bool {
        self.records.lock().unwrap().iter().any(|r| &r.build == build)
    }

    fn delete(&self, build: &Build) -> Result<(), Error> {
        self.records.lock().unwrap().retain(|r| &r.build != build);
        Ok(())
    }

    fn for_machine(&self, machine: &str) -> Result<Vec<BuildRecord>, Error> {
        let mut records: Vec<BuildRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.build.machine == machine)
            .cloned()
            .collect();
        sort_for_machine(&mut records);
        Ok(records)
    }

    fn previous(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let Some(built) = record.built else { return Ok(None) };
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.build.machine == record.build.machine)
            .filter(|r| !completed_only || r.completed.is_some())
            .filter(|r| r.built.is_some_and(|b| b < built))
            .max_by_key(|r| r.built)
            .cloned())
    }

    fn next(&self, record: &BuildRecord, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let Some(built) = record.built else { return Ok(None) };
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.build.machine == record.build.machine)
            .filter(|r| !completed_only || r.completed.is_some())
            .filter(|r| r.built.is_some_and(|b| b > built))
            .min_by_key(|r| r.built)
            .cloned())
    }

    fn latest(&self, machine: &str, completed_only: bool) -> Result<Option<BuildRecord>, Error> {
        let records = self.records.lock().unwrap();
        let candidates: Vec<&BuildRecord> = records
            .iter()
            .filter(|r| r.build.machine == machine)
            .filter(|r| !completed_only || r.completed.is_some())
            .collect();

        if candidates.iter().any(|r| r.built.is_some()) {
            return Ok(candidates
                .into_iter()
                .filter(|r| r.built.is_some())
                .max_by_key(|r| r.built)
                .cloned());
        }
        Ok(pick_latest_by_build_id(candidates.into_iter()).cloned())
    }

    fn list_machines(&self) -> Result<Vec<String>, Error> {
        let records = self.records.lock().unwrap();
        let mut machines: Vec<String> = records
            .iter()
            .map(|r| r.build.machine.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        machines.sort();
        Ok(machines)
    }

    fn search(&self, machine: &str, field: &str, key: &str) -> Result<Vec<BuildRecord>, Error> {
        let field = crate::SearchField::parse(field)?;
        let key = key.to_ascii_lowercase();
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.build.machine == machine)
            .filter(|r| {
                let haystack = match field {
                    crate::SearchField::Logs => r.logs.as_deref(),
                    crate::SearchField::Note => r.note.as_deref(),
                };
                haystack
                    .map(|h| h.to_ascii_lowercase().contains(&key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn count(&self, machine: Option<&str>) -> Result<usize, Error> {
        let records = self.records.lock().unwrap();
        Ok(match machine {
            Some(m) => records.iter().filter(|r| r.build.machine == m).count(),
            None => records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_sets_submitted_when_absent() {
        let db = MemoryRecordDb::new();
        let record = BuildRecord::unsaved(Build::new("babette", "1").unwrap());
        let saved = db.save(record).unwrap();
        assert!(saved.submitted.is_some());
    }

    #[test]
    fn save_upserts() {
        let db = MemoryRecordDb::new();
        let build = Build::new("babette", "1").unwrap();
        db.save(BuildRecord::unsaved(build.clone())).unwrap();
        let mut updated = BuildRecord::unsaved(build.clone());
        updated.note = Some("hello".into());
        db.save(updated).unwrap();

        let fetched = db.get(&build).unwrap();
        assert_eq!(fetched.note.as_deref(), Some("hello"));
        assert_eq!(db.count(None).unwrap(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = MemoryRecordDb::new();
        let build = Build::new("babette", "1").unwrap();
        assert!(matches!(db.get(&build), Err(Error::NotFound(_))));
        assert!(!db.exists(&build));
    }

    #[test]
    fn delete_is_idempotent() {
        let db = MemoryRecordDb::new();
        let build = Build::new("babette", "1").unwrap();
        db.save(BuildRecord::unsaved(build.clone())).unwrap();
        db.delete(&build).unwrap();
        db.delete(&build).unwrap();
        assert!(!db.exists(&build));
    }

    #[test]
    fn search_rejects_non_searchable_fields() {
        let db = MemoryRecordDb::new();
        assert!(matches!(
            db.search("babette", "build_id", "x"),
            Err(Error::NotSearchable(_))
        ));
    }

    #[test]
    fn search_matches_logs_case_insensitively() {
        let db = MemoryRecordDb::new();
        let mut record = BuildRecord::unsaved(Build::new("babette", "1").unwrap());
        record.logs = Some("Build SUCCEEDED".into());
        db.save(record).unwrap();

        let hits = db.search("babette", "logs", "succeeded").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn latest_falls_back_to_build_id_when_nothing_has_built() {
        let db = MemoryRecordDb::new();
        db.save(BuildRecord::unsaved(Build::new("m", "2").unwrap())).unwrap();
        db.save(BuildRecord::unsaved(Build::new("m", "10").unwrap())).unwrap();
        let latest = db.latest("m", false).unwrap().unwrap();
        assert_eq!(latest.build.build_id, "10");
    }

    #[test]
    fn latest_with_no_builds_is_none() {
        let db = MemoryRecordDb::new();
        assert!(db.latest("nothing", false).unwrap().is_none());
    }
}
