//! Storage integrity checks.
//!
//! Grounded on `checks.py`'s five checks (`build_content`, `orphans`,
//! `inconsistent_tags`, `dirty_temp`, `corrupt_gbp_json`), each returning an
//! `(errors, warnings)` pair there (`CheckResult`); [`CheckOutcome`] is the
//! same shape, collecting the actual messages rather than just counts.

use std::collections::{HashMap, HashSet};
use std::fs;

use gbp_records::RecordDb;
use gbp_storage::Storage;
use gbp_types::{Build, Content};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Records(#[from] gbp_records::Error),
}

/// The result of one check: every problem found, split into errors
/// (definitely wrong) and warnings (worth a look).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckOutcome {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    fn merge(mut self, other: CheckOutcome) -> Self {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }
}

/// Every completed record must have all four Content directories on disk.
pub fn build_content(records: &dyn RecordDb, storage: &Storage) -> Result<CheckOutcome, Error> {
    let mut outcome = CheckOutcome::default();
    for machine in records.list_machines()? {
        for record in records.for_machine(&machine)? {
            if record.completed.is_none() {
                continue;
            }
            if !storage.pulled(&record.build) {
                outcome
                    .errors
                    .push(format!("{}: missing one or more content directories", record.build));
            }
        }
    }
    Ok(outcome)
}

/// Build directories on disk with no matching record, and symlinks whose
/// target no longer exists.
pub fn orphans(records: &dyn RecordDb, storage: &Storage) -> Result<CheckOutcome, Error> {
    let mut outcome = CheckOutcome::default();
    for content in Content::ALL {
        let dir = storage.root().join(content.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if file_type.is_symlink() {
                if fs::metadata(entry.path()).is_err() {
                    outcome
                        .warnings
                        .push(format!("{}/{name}: dangling symlink", content.as_str()));
                }
                continue;
            }
            if !file_type.is_dir() {
                continue;
            }
            let Some((machine, build_id)) = name.split_once('.') else {
                continue;
            };
            let Ok(build) = Build::new(machine, build_id) else {
                continue;
            };
            if !records.exists(&build) {
                outcome
                    .errors
                    .push(format!("{}/{name}: orphaned build directory", content.as_str()));
            }
        }
    }
    Ok(outcome)
}

/// A tag's symlink must resolve to the same build dir in every Content dir.
/// Grouped by the symlink's own filename (e.g. `"babette"` for the
/// published tag, `"babette@stable"` for a named one), since that's what
/// must agree across `repos`/`binpkgs`/`etc-portage`/`var-lib-portage`.
pub fn inconsistent_tags(storage: &Storage) -> Result<CheckOutcome, Error> {
    let mut outcome = CheckOutcome::default();
    let mut targets: HashMap<String, HashSet<String>> = HashMap::new();

    for content in Content::ALL {
        let dir = storage.root().join(content.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(target) = fs::read_link(entry.path()) {
                targets
                    .entry(name)
                    .or_default()
                    .insert(target.to_string_lossy().into_owned());
            }
        }
    }

    let mut tags: Vec<_> = targets.into_iter().collect();
    tags.sort_by(|a, b| a.0.cmp(&b.0));
    for (tag, target_set) in tags {
        if target_set.len() > 1 {
            outcome
                .errors
                .push(format!("{tag}: inconsistent targets across content directories"));
        }
    }
    Ok(outcome)
}

/// Leftover staging directories under `tmp/`: a previous extract that never
/// cleaned up, usually from a crash mid-pull.
pub fn dirty_temp(storage: &Storage) -> Result<CheckOutcome, Error> {
    let mut outcome = CheckOutcome::default();
    let tmp = storage.root().join("tmp");
    match fs::read_dir(&tmp) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                outcome.warnings.push(format!(
                    "tmp/{}: leftover staging directory",
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(outcome)
}

/// Every completed build's `gbp.json` should exist and parse. Missing is a
/// warning (it can be regenerated, see `Publisher::build_metadata`);
/// present-but-unparseable is an error.
pub fn corrupt_gbp_json(records: &dyn RecordDb, storage: &Storage) -> Result<CheckOutcome, Error> {
    let mut outcome = CheckOutcome::default();
    for machine in records.list_machines()? {
        for record in records.for_machine(&machine)? {
            if record.completed.is_none() {
                continue;
            }
            if storage.get_metadata(&record.build).is_ok() {
                continue;
            }
            let path = storage
                .root()
                .join(Content::Binpkgs.as_str())
                .join(record.build.dir_name())
                .join("gbp.json");
            if path.exists() {
                outcome
                    .errors
                    .push(format!("{}: gbp.json exists but failed to parse", record.build));
            } else {
                outcome
                    .warnings
                    .push(format!("{}: gbp.json is missing", record.build));
            }
        }
    }
    Ok(outcome)
}

/// Run every check and merge the results.
pub fn run_all(records: &dyn RecordDb, storage: &Storage) -> Result<CheckOutcome, Error> {
    Ok(build_content(records, storage)?
        .merge(orphans(records, storage)?)
        .merge(inconsistent_tags(storage)?)
        .merge(dirty_temp(storage)?)
        .merge(corrupt_gbp_json(records, storage)?))
}
