//! Core value types for Gentoo Build Publisher.
//!
//! This crate has no I/O. It defines the identifiers and records that every
//! other crate in the workspace passes around: [`Build`], [`BuildRecord`],
//! [`Content`], [`Package`], [`GBPMetadata`], [`ApiKey`] and the tag-name
//! grammar.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod cpv;
mod tag;

pub use cpv::{CpvError, split_cpv};
pub use tag::{TAG_MAX_LEN, validate_tag_name};

/// Errors raised while constructing or validating core types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid build identifier: {0:?}")]
    InvalidBuild(String),
    #[error("invalid tag name: {0:?}")]
    InvalidTagName(String),
}

/// The one of four subtrees every build carries.
///
/// The order here (`repos` first) matters: [`Content::canonical`] is the
/// directory used whenever only one of the four needs to be consulted, e.g.
/// resolving which build a tag currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Content {
    Repos,
    Binpkgs,
    EtcPortage,
    VarLibPortage,
}

impl Content {
    /// All four, in storage-layout order.
    pub const ALL: [Content; 4] = [
        Content::Repos,
        Content::Binpkgs,
        Content::EtcPortage,
        Content::VarLibPortage,
    ];

    /// The directory consulted when only one Content dir is needed (tag
    /// resolution, `Repos(build)`).
    pub const fn canonical() -> Content {
        Content::Repos
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Content::Repos => "repos",
            Content::Binpkgs => "binpkgs",
            Content::EtcPortage => "etc-portage",
            Content::VarLibPortage => "var-lib-portage",
        }
    }
}

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable `(machine, build_id)` pair. String form is `"<machine>.<build_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Build {
    pub machine: String,
    pub build_id: String,
}

impl Build {
    pub fn new(machine: impl Into<String>, build_id: impl Into<String>) -> Result<Self, Error> {
        let machine = machine.into();
        let build_id = build_id.into();
        if machine.is_empty() || build_id.is_empty() {
            return Err(Error::InvalidBuild(format!("{machine}.{build_id}")));
        }
        Ok(Self { machine, build_id })
    }

    /// The directory/symlink-target name for this build: `"<machine>.<build_id>"`.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.machine, self.build_id)
    }

    /// Try to parse `build_id` as an integer, for the legacy fallback sort
    /// key `Latest` uses when no record has a `built` timestamp.
    pub fn build_id_sort_key(&self) -> BuildIdKey<'_> {
        match self.build_id.parse::<i64>() {
            Ok(n) => BuildIdKey::Numeric(n),
            Err(_) => BuildIdKey::Lexical(&self.build_id),
        }
    }
}

/// Sort key for the legacy `build_id` fallback ordering: numeric ids sort
/// before lexical ones and compare as integers; non-numeric ids fall back to
/// string order among themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildIdKey<'a> {
    Numeric(i64),
    Lexical(&'a str),
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.machine, self.build_id)
    }
}

impl FromStr for Build {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (machine, build_id) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidBuild(s.to_string()))?;
        Build::new(machine, build_id)
    }
}

/// A Build plus the mutable metadata GBP accumulates about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build: Build,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub keep: bool,
    #[serde(default)]
    pub submitted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub built: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// A fresh, unsaved record for `build`: no timestamps, `keep = false`.
    pub fn unsaved(build: Build) -> Self {
        Self {
            build,
            note: None,
            logs: None,
            keep: false,
            submitted: None,
            completed: None,
            built: None,
        }
    }
}

/// A single package entry parsed out of `binpkgs/Packages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub cpv: String,
    pub repo: String,
    pub path: String,
    pub build_id: i64,
    pub size: i64,
    pub build_time: i64,
}

impl Package {
    /// `"<cpv>-<build_id>"`, the identity key used for diffing package lists.
    pub fn cpvb(&self) -> String {
        format!("{}-{}", self.cpv, self.build_id)
    }
}

/// The `binpkgs/gbp.json` sidecar, written on pull and regenerable from
/// `Storage::get_packages` plus the record's timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GBPMetadata {
    pub build_duration: i64,
    pub packages: PackageSummary,
    pub gbp_hostname: String,
    pub gbp_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub total: usize,
    pub size: i64,
    pub built: Vec<Package>,
}

impl GBPMetadata {
    /// Compute deterministically from CI metadata and the build's package
    /// list: `built` is every package whose `build_time >= floor(timestamp_ms / 1000)`.
    pub fn compute(
        build_duration: i64,
        ci_timestamp_ms: i64,
        packages: &[Package],
        gbp_hostname: impl Into<String>,
        gbp_version: impl Into<String>,
    ) -> Self {
        let ci_built_sec = ci_timestamp_ms.div_euclid(1000);
        let built: Vec<Package> = packages
            .iter()
            .filter(|p| p.build_time >= ci_built_sec)
            .cloned()
            .collect();
        let total = packages.len();
        let size = packages.iter().map(|p| p.size).sum();
        Self {
            build_duration,
            packages: PackageSummary { total, size, built },
            gbp_hostname: gbp_hostname.into(),
            gbp_version: gbp_version.into(),
        }
    }
}

/// An encrypted API key: `(name, key, created, last_used)`.
///
/// `key` is the ciphertext (base64, produced by the encryption routine in
/// `gbp-core`'s `apikey` module), never the plaintext secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_round_trips_through_display_and_from_str() {
        let b = Build::new("babette", "1").unwrap();
        assert_eq!(b.to_string(), "babette.1");
        assert_eq!(b, "babette.1".parse().unwrap());
    }

    #[test]
    fn build_rejects_empty_fields() {
        assert!(Build::new("", "1").is_err());
        assert!(Build::new("babette", "").is_err());
    }

    #[test]
    fn build_from_str_requires_a_dot() {
        assert!("nodothere".parse::<Build>().is_err());
    }

    #[test]
    fn gbp_metadata_computes_built_list_and_totals() {
        let packages = vec![
            Package {
                cpv: "app-arch/unzip-6.0_p26".into(),
                repo: "gentoo".into(),
                path: "app-arch/unzip-6.0_p26-1.xpak".into(),
                build_id: 1,
                size: 100,
                build_time: 1_700_000_100,
            },
            Package {
                cpv: "acct-group/sgx-0".into(),
                repo: "gentoo".into(),
                path: "acct-group/sgx-0-1.xpak".into(),
                build_id: 1,
                size: 50,
                build_time: 1_600_000_000,
            },
        ];
        let meta = GBPMetadata::compute(
            42,
            1_700_000_000_000,
            &packages,
            "builder",
            "0.1.0",
        );
        assert_eq!(meta.packages.total, 2);
        assert_eq!(meta.packages.size, 150);
        assert_eq!(meta.packages.built.len(), 1);
        assert_eq!(meta.packages.built[0].cpv, "app-arch/unzip-6.0_p26");
    }

    #[test]
    fn package_cpvb_combines_cpv_and_build_id() {
        let p = Package {
            cpv: "app-arch/unzip-6.0_p26".into(),
            repo: "gentoo".into(),
            path: "x".into(),
            build_id: 3,
            size: 1,
            build_time: 1,
        };
        assert_eq!(p.cpvb(), "app-arch/unzip-6.0_p26-3");
    }
}
