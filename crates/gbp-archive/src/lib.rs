//! Dump every build's record and storage tree to a single tar stream, and
//! restore from one.
//!
//! Grounded on `utils/archive/__init__.py`, `records.py` and `storage.py`:
//! the outer archive has a `records.json` member (the full `BuildRecord`
//! list, JSON-encoded) and a `storage.tar` member (an inner tar holding each
//! build's four Content subtrees plus every tag symlink, including the
//! published/empty one, that currently resolves to it). This crate adds a
//! third, leading `metadata.json` member ([`metadata::DumpMetadata`]); its
//! absence on restore is tolerated; see `metadata.rs`.

use std::io::{Read, Write};
use std::path::{Component, Path};

use gbp_core::Publisher;
use gbp_types::{Build, Content};

mod metadata;
pub use metadata::{CURRENT_VERSION, DumpMetadata};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Records(#[from] gbp_records::Error),
    #[error(transparent)]
    Storage(#[from] gbp_storage::Error),
    #[error("archive is missing required member {0:?}")]
    MissingMember(&'static str),
}

/// Which half of a dump/restore pass a [`Progress`] callback is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Records,
    Storage,
}

/// Which direction a [`Progress`] callback is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dump,
    Restore,
}

/// Called once per build per phase, so a caller can render progress.
pub type Progress<'a> = dyn FnMut(Direction, Phase, &Build) + 'a;

/// Write `builds` (sorted by `(machine, build_id)`) to `writer` as a single
/// outer tar: `metadata.json`, `records.json`, then `storage.tar`.
pub fn dump<W: Write>(
    publisher: &Publisher,
    builds: &[Build],
    writer: W,
    created: chrono::DateTime<chrono::Utc>,
    mut progress: impl FnMut(Direction, Phase, &Build),
) -> Result<(), Error> {
    let mut builds: Vec<Build> = builds.to_vec();
    builds.sort_by(|a, b| (&a.machine, &a.build_id).cmp(&(&b.machine, &b.build_id)));

    let mut outer = tar::Builder::new(writer);

    let meta = DumpMetadata::new(created, builds.len());
    append_buf(&mut outer, "metadata.json", &serde_json::to_vec(&meta)?)?;

    let mut records = Vec::with_capacity(builds.len());
    for build in &builds {
        progress(Direction::Dump, Phase::Records, build);
        records.push(publisher.records().get(build)?);
    }
    append_buf(&mut outer, "records.json", &serde_json::to_vec(&records)?)?;

    let mut storage_buf = Vec::new();
    {
        let mut inner = tar::Builder::new(&mut storage_buf);
        for build in &builds {
            progress(Direction::Dump, Phase::Storage, build);
            dump_build_storage(publisher, build, &mut inner)?;
        }
        inner.finish()?;
    }
    append_buf(&mut outer, "storage.tar", &storage_buf)?;

    outer.finish()?;
    Ok(())
}

/// Read an archive produced by [`dump`], restoring every record and the
/// storage tree it names. Returns the builds restored, in archive order.
pub fn restore<R: Read>(
    publisher: &Publisher,
    reader: R,
    mut progress: impl FnMut(Direction, Phase, &Build),
) -> Result<Vec<Build>, Error> {
    let mut restored = Vec::new();
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        match name.as_str() {
            "metadata.json" => {
                // Informational only: nothing downstream depends on it yet,
                // but a future format bump can branch on `.version` here.
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                let _meta: DumpMetadata = serde_json::from_slice(&buf)?;
            }
            "records.json" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                let records: Vec<gbp_types::BuildRecord> = serde_json::from_slice(&buf)?;
                for record in records {
                    progress(Direction::Restore, Phase::Records, &record.build);
                    publisher.records().save(record)?;
                }
            }
            "storage.tar" => {
                let root = publisher.storage().root().to_path_buf();
                let mut inner = tar::Archive::new(&mut entry);
                for inner_entry in inner.entries()? {
                    let mut inner_entry = inner_entry?;
                    let path = inner_entry.path()?.into_owned();
                    let is_dir = inner_entry.header().entry_type().is_dir();
                    if let Some(build) = build_dir_in_canonical_content(&path, is_dir) {
                        progress(Direction::Restore, Phase::Storage, &build);
                        if !restored.contains(&build) {
                            restored.push(build);
                        }
                    }
                    inner_entry.unpack_in(&root)?;
                }
            }
            _ => {}
        }
    }

    Ok(restored)
}

fn append_buf<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn dump_build_storage<W: Write>(
    publisher: &Publisher,
    build: &Build,
    tar_builder: &mut tar::Builder<W>,
) -> Result<(), Error> {
    let storage = publisher.storage();
    let root = storage.root();

    for content in Content::ALL {
        let build_dir = root.join(content.as_str()).join(build.dir_name());
        if build_dir.is_dir() {
            let arcname = format!("{}/{}", content.as_str(), build.dir_name());
            tar_builder.append_dir_all(&arcname, &build_dir)?;
        }
    }

    // Every tag (including the empty/published one) that currently
    // resolves to `build`, mirrored across all four Content dirs so restore
    // reproduces the exact symlink set.
    let tags = storage.get_tags(build, true)?;
    for content in Content::ALL {
        for tag in &tags {
            let link_name = if tag.is_empty() {
                format!("{}/{}", content.as_str(), build.machine)
            } else {
                format!("{}/{}@{}", content.as_str(), build.machine, tag)
            };
            let link_path = root.join(&link_name);
            if let Ok(target) = std::fs::read_link(&link_path) {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_cksum();
                tar_builder.append_link(&mut header, &link_name, &target)?;
            }
        }
    }
    Ok(())
}

/// `"repos/<machine>.<build_id>"`, exactly two components deep under the
/// canonical Content dir, is the one member per build whose restore we
/// report progress for — mirrors the original's `is_content_dir(member,
/// Content.REPOS)` check, avoiding one callback per Content dir.
fn build_dir_in_canonical_content(path: &Path, is_dir: bool) -> Option<Build> {
    if !is_dir {
        return None;
    }
    let mut components = path.components();
    let Component::Normal(first) = components.next()? else {
        return None;
    };
    if first.to_str()? != Content::canonical().as_str() {
        return None;
    }
    let Component::Normal(second) = components.next()? else {
        return None;
    };
    if components.next().is_some() {
        return None;
    }
    second.to_str()?.parse().ok()
}
