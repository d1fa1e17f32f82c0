//! Aggregate read-only queries over a [`Publisher`]'s machines and builds,
//! plus the storage integrity checks in [`checks`].
//!
//! Grounded on `stats.py`'s `StatsCollector`. The original also offers a
//! `Stats.with_cache()` wrapper backed by a site-wide key-value cache
//! (`GBPSiteCache`); that cache is out of scope (see spec's Non-goals on a
//! site-wide cache), so only the collection logic is ported here, always
//! computed fresh from `Publisher`.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use gbp_core::{MachineInfo, Publisher};
use gbp_types::{Build, BuildRecord, Package};

pub mod checks;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Publisher(#[from] gbp_core::PublisherError),
    #[error(transparent)]
    Machine(#[from] gbp_core::machine::Error),
    #[error(transparent)]
    Storage(#[from] gbp_storage::Error),
    #[error(transparent)]
    Records(#[from] gbp_records::Error),
}

/// Computes every aggregate against one `Publisher`, always fresh — no
/// caching or memoisation, unlike the original's `@cached_property` fields.
pub struct StatsCollector<'a> {
    publisher: &'a Publisher,
}

impl<'a> StatsCollector<'a> {
    pub fn new(publisher: &'a Publisher) -> Self {
        Self { publisher }
    }

    /// Every known machine's [`MachineInfo`], ordered by build count
    /// descending then name ascending.
    pub fn machines(&self) -> Result<Vec<MachineInfo>, Error> {
        let mut infos = self.publisher.machines(None)?;
        infos.sort_by(|a, b| b.build_count.cmp(&a.build_count).then_with(|| a.machine.cmp(&b.machine)));
        Ok(infos)
    }

    /// `build`'s parsed package list.
    pub fn build_packages(&self, build: &Build) -> Result<Vec<Package>, Error> {
        Ok(self.publisher.storage().get_packages(build)?)
    }

    /// Package count of `machine`'s latest completed build, 0 if it has none.
    pub fn package_count(&self, machine: &str) -> Result<usize, Error> {
        match self.latest_build(machine)? {
            Some(record) => Ok(self.build_packages(&record.build)?.len()),
            None => Ok(0),
        }
    }

    pub fn latest_build(&self, machine: &str) -> Result<Option<BuildRecord>, Error> {
        Ok(self.publisher.latest_build(machine, true)?)
    }

    /// The build currently published for `machine`, if any.
    pub fn latest_published(&self, machine: &str) -> Result<Option<Build>, Error> {
        let info = MachineInfo::new(machine, self.publisher.records(), self.publisher.storage())?;
        Ok(info.published_build)
    }

    /// Up to `maximum` distinct packages (by `cpvb`) from `machine`'s most
    /// recent completed builds, most recent first.
    pub fn recent_packages(&self, machine: &str, maximum: usize) -> Result<Vec<Package>, Error> {
        let builds = self.publisher.records().for_machine(machine)?;
        let mut seen = HashSet::new();
        let mut packages = Vec::new();
        for record in builds.iter().filter(|r| r.completed.is_some()) {
            for package in self.build_packages(&record.build)? {
                if packages.len() >= maximum {
                    return Ok(packages);
                }
                if seen.insert(package.cpvb()) {
                    packages.push(package);
                }
            }
        }
        Ok(packages)
    }

    /// Total byte size of `machine`'s latest completed build's packages.
    pub fn total_package_size(&self, machine: &str) -> Result<i64, Error> {
        match self.latest_build(machine)? {
            Some(record) => Ok(self.build_packages(&record.build)?.iter().map(|p| p.size).sum()),
            None => Ok(0),
        }
    }

    /// Number of builds submitted on `machine` per calendar day.
    pub fn builds_by_day(&self, machine: &str) -> Result<BTreeMap<NaiveDate, usize>, Error> {
        let builds = self.publisher.records().for_machine(machine)?;
        let mut counts = BTreeMap::new();
        for record in builds {
            if let Some(submitted) = record.submitted {
                *counts.entry(submitted.date_naive()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// `machine`'s built packages, grouped by the calendar day they were
    /// built (per [`BuildRecord::built`]).
    pub fn packages_by_day(&self, machine: &str) -> Result<BTreeMap<NaiveDate, Vec<Package>>, Error> {
        let builds = self.publisher.records().for_machine(machine)?;
        let mut by_day: BTreeMap<NaiveDate, Vec<Package>> = BTreeMap::new();
        for record in builds.iter().filter(|r| r.completed.is_some()) {
            let Some(built) = record.built else { continue };
            let packages = self.build_packages(&record.build).unwrap_or_default();
            by_day.entry(built.date_naive()).or_default().extend(packages);
        }
        Ok(by_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbp_ci::{BuildMetadata as CiBuildMetadata, FakeCiClient};
    use gbp_records::MemoryRecordDb;
    use gbp_storage::Storage;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn packages_tar(cpvs: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut index = String::new();
        for (i, cpv) in cpvs.iter().enumerate() {
            index.push_str(&format!(
                "\nCPV: {cpv}\nREPO: gentoo\nPATH: x\nBUILD_ID: 1\nSIZE: 10\nBUILD_TIME: {}\n",
                1_700_000_000 + i as i64
            ));
        }
        let files: &[(&str, &[u8])] = &[
            ("repos/x", b"1"),
            ("binpkgs/Packages", index.as_bytes()),
            ("etc-portage/x", b"1"),
            ("var-lib-portage/x", b"1"),
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
    fn package_count_is_zero_for_an_unknown_machine() {
        let (_td, publisher) = publisher();
        let stats = StatsCollector::new(&publisher);
        assert_eq!(stats.package_count("babette").unwrap(), 0);
    }

    #[test]
    fn package_count_reflects_the_latest_completed_build() {
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let ci_client = FakeCiClient::new();
        let build = Build::new("babette", "1").unwrap();
        ci_client.with_artifact(&build, packages_tar(&["app-arch/unzip-6.0_p26", "dev-lang/rust-1.0"]));
        ci_client.with_logs(&build, "ok");
        ci_client.with_metadata(&build, CiBuildMetadata { duration_seconds: 1, timestamp_ms: 1_700_000_000_000 });
        let publisher = Publisher::new(Arc::new(ci_client), storage, Arc::new(MemoryRecordDb::new()), "builder", "0.1.0");
        publisher.pull(&build, None, &[]).unwrap();

        let stats = StatsCollector::new(&publisher);
        assert_eq!(stats.package_count("babette").unwrap(), 2);
        assert_eq!(stats.total_package_size("babette").unwrap(), 20);
    }

    #[test]
    fn machines_are_sorted_by_build_count_then_name() {
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let ci_client = FakeCiClient::new();
        let a1 = Build::new("alpha", "1").unwrap();
        let z1 = Build::new("zeta", "1").unwrap();
        let z2 = Build::new("zeta", "2").unwrap();
        for b in [&a1, &z1, &z2] {
            ci_client.with_artifact(b, packages_tar(&[]));
            ci_client.with_logs(b, "");
            ci_client.with_metadata(b, CiBuildMetadata { duration_seconds: 1, timestamp_ms: 1_700_000_000_000 });
        }
        let publisher = Publisher::new(Arc::new(ci_client), storage, Arc::new(MemoryRecordDb::new()), "builder", "0.1.0");
        publisher.pull(&a1, None, &[]).unwrap();
        publisher.pull(&z1, None, &[]).unwrap();
        publisher.pull(&z2, None, &[]).unwrap();

        let stats = StatsCollector::new(&publisher);
        let machines = stats.machines().unwrap();
        assert_eq!(machines[0].machine, "zeta");
        assert_eq!(machines[1].machine, "alpha");
    }

    #[test]
    fn recent_packages_deduplicates_across_builds_and_caps_at_maximum() {
        let td = tempdir().unwrap();
        let storage = Storage::new(td.path());
        storage.init().unwrap();
        let ci_client = FakeCiClient::new();
        let b1 = Build::new("babette", "1").unwrap();
        let b2 = Build::new("babette", "2").unwrap();
        ci_client.with_artifact(&b1, packages_tar(&["app-arch/unzip-6.0_p26"]));
        ci_client.with_artifact(&b2, packages_tar(&["app-arch/unzip-6.0_p26", "dev-lang/rust-1.0"]));
        for b in [&b1, &b2] {
            ci_client.with_logs(b, "");
            ci_client.with_metadata(b, CiBuildMetadata { duration_seconds: 1, timestamp_ms: 1_700_000_000_000 });
        }
        let publisher = Publisher::new(Arc::new(ci_client), storage, Arc::new(MemoryRecordDb::new()), "builder", "0.1.0");
        publisher.pull(&b1, None, &[]).unwrap();
        publisher.pull(&b2, None, &[]).unwrap();

        let stats = StatsCollector::new(&publisher);
        let packages = stats.recent_packages("babette", 2).unwrap();
        assert_eq!(packages.len(), 2);
    }
}
