//! Per-build directory layout, extraction with link-deduplication, and the
//! tag/publish symlink machinery.
//!
//! ```text
//! <root>/<content>/<machine>.<build_id>/…     build tree
//! <root>/<content>/<machine>                  symlink -> published build
//! <root>/<content>/<machine>@<tag>             symlink -> tagged build
//! <root>/tmp/<machine>.<build_id>/             staging during extract
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use gbp_types::{Build, Content, GBPMetadata, Package};
use tracing::instrument;

mod packages;
pub use packages::parse_packages_index;

/// Errors raised by [`Storage`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build is not fully pulled: {0}")]
    NotPulled(Build),
    #[error(transparent)]
    InvalidTagName(#[from] gbp_types::Error),
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("{what} missing for {build}")]
    LookupError { what: &'static str, build: Build },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fs(#[from] anyhow::Error),
    #[error("symlink for tag {tag:?} has inconsistent targets across content dirs")]
    Integrity { tag: String },
}

/// Owns the filesystem tree for every build, rooted at `STORAGE_PATH`.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the four Content directories and `tmp/` under the root.
    pub fn init(&self) -> Result<(), Error> {
        for c in Content::ALL {
            fs::create_dir_all(self.root.join(c.as_str()))?;
        }
        fs::create_dir_all(self.root.join("tmp"))?;
        Ok(())
    }

    fn build_path(&self, content: Content, build: &Build) -> PathBuf {
        self.root.join(content.as_str()).join(build.dir_name())
    }

    fn tmp_path(&self, build: &Build) -> PathBuf {
        self.root.join("tmp").join(build.dir_name())
    }

    fn link_path(&self, content: Content, machine: &str, tag: &str) -> PathBuf {
        if tag.is_empty() {
            self.root.join(content.as_str()).join(machine)
        } else {
            self.root.join(content.as_str()).join(format!("{machine}@{tag}"))
        }
    }

    /// True iff all four Content directories exist for `build`.
    pub fn pulled(&self, build: &Build) -> bool {
        Content::ALL
            .iter()
            .all(|&c| self.build_path(c, build).is_dir())
    }

    /// Stage `reader`'s tar stream, extract it, and move/link each Content
    /// subtree into place. Idempotent: a no-op if already pulled. The
    /// staging directory is always removed, on both success and failure.
    #[instrument(level = "debug", skip(self, reader), fields(build = %build))]
    pub fn extract_artifact<R: Read>(
        &self,
        build: &Build,
        reader: R,
        previous: Option<&Build>,
    ) -> Result<(), Error> {
        if self.pulled(build) {
            return Ok(());
        }

        let tmp = self.tmp_path(build);
        let result = self.extract_artifact_inner(build, reader, previous, &tmp);
        fs::remove_dir_all(&tmp).ok();
        result
    }

    fn extract_artifact_inner<R: Read>(
        &self,
        build: &Build,
        reader: R,
        previous: Option<&Build>,
        tmp: &Path,
    ) -> Result<(), Error> {
        gbp_fs::extract_tar(reader, tmp)?;

        for c in Content::ALL {
            let staged = tmp.join(c.as_str());
            let dest = self.build_path(c, build);
            if !staged.is_dir() {
                fs::create_dir_all(&dest)?;
                continue;
            }
            match previous {
                Some(prev) => {
                    let prev_path = self.build_path(c, prev);
                    gbp_fs::quick_check_copy_tree(&staged, &dest, Some(&prev_path))?;
                }
                None => gbp_fs::move_tree(&staged, &dest)?,
            }
        }
        Ok(())
    }

    /// Atomically point `<machine>`'s symlink set at `build`. Requires
    /// `pulled(build)`.
    pub fn publish(&self, build: &Build) -> Result<(), Error> {
        if !self.pulled(build) {
            return Err(Error::NotPulled(build.clone()));
        }
        for c in Content::ALL {
            let link = self.link_path(c, &build.machine, "");
            gbp_fs::atomic_symlink(Path::new(&build.dir_name()), &link)?;
        }
        Ok(())
    }

    /// True iff every Content symlink for `build.machine` resolves to `build`.
    pub fn published(&self, build: &Build) -> bool {
        Content::ALL.iter().all(|&c| {
            let link = self.link_path(c, &build.machine, "");
            fs::read_link(&link)
                .map(|target| target == Path::new(&build.dir_name()))
                .unwrap_or(false)
        })
    }

    /// Tag `build` as `name`. Empty name is equivalent to [`Storage::publish`].
    pub fn tag(&self, build: &Build, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return self.publish(build);
        }
        gbp_types::validate_tag_name(name)?;
        for c in Content::ALL {
            let link = self.link_path(c, &build.machine, name);
            gbp_fs::atomic_symlink(Path::new(&build.dir_name()), &link)?;
        }
        Ok(())
    }

    /// Remove the tag `name` for `machine`. Missing symlinks are ignored.
    /// Empty name unpublishes.
    pub fn untag(&self, machine: &str, name: &str) -> Result<(), Error> {
        for c in Content::ALL {
            let link = self.link_path(c, machine, name);
            gbp_fs::remove_symlink_if_present(&link)?;
        }
        Ok(())
    }

    /// Sorted tag names whose symlinks resolve to `build`, read from the
    /// canonical Content dir (`repos`). `include_published` controls
    /// whether the empty/"published" tag is included.
    pub fn get_tags(&self, build: &Build, include_published: bool) -> Result<Vec<String>, Error> {
        let dir = self.root.join(Content::canonical().as_str());
        let prefix = format!("{}@", build.machine);
        let mut tags = Vec::new();

        if include_published {
            let published_link = dir.join(&build.machine);
            if fs::read_link(&published_link)
                .map(|t| t == Path::new(&build.dir_name()))
                .unwrap_or(false)
            {
                tags.push(String::new());
            }
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let Some(tag) = name.strip_prefix(&prefix) else {
                continue;
            };
            let path = dir.join(&*name);
            if fs::read_link(&path)
                .map(|t| t == Path::new(&build.dir_name()))
                .unwrap_or(false)
            {
                tags.push(tag.to_string());
            }
        }
        tags.sort();
        Ok(tags)
    }

    /// Resolve `"<machine>@<tag>"` (or bare `"<machine>"` for the published
    /// tag) to the [`Build`] it currently targets.
    pub fn resolve_tag(&self, machine_at_tag: &str) -> Result<Build, Error> {
        let (machine, tag) = machine_at_tag
            .split_once('@')
            .unwrap_or((machine_at_tag, ""));
        let link = self.link_path(Content::canonical(), machine, tag);
        let target = fs::read_link(&link).map_err(|_| Error::TagNotFound(machine_at_tag.to_string()))?;
        let dir_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::TagNotFound(machine_at_tag.to_string()))?;
        dir_name
            .parse()
            .map_err(|_| Error::TagNotFound(machine_at_tag.to_string()))
    }

    /// Parse `binpkgs/Packages` for `build`.
    pub fn get_packages(&self, build: &Build) -> Result<Vec<Package>, Error> {
        let path = self.build_path(Content::Binpkgs, build).join("Packages");
        let content = fs::read_to_string(&path).map_err(|_| Error::LookupError {
            what: "Packages index",
            build: build.clone(),
        })?;
        parse_packages_index(&content).map_err(|_| Error::LookupError {
            what: "Packages index",
            build: build.clone(),
        })
    }

    /// Read `binpkgs/gbp.json`.
    pub fn get_metadata(&self, build: &Build) -> Result<GBPMetadata, Error> {
        let path = self.build_path(Content::Binpkgs, build).join("gbp.json");
        let content = fs::read_to_string(&path).map_err(|_| Error::LookupError {
            what: "gbp.json",
            build: build.clone(),
        })?;
        serde_json::from_str(&content).map_err(|_| Error::LookupError {
            what: "gbp.json",
            build: build.clone(),
        })
    }

    /// Write `binpkgs/gbp.json`.
    pub fn set_metadata(&self, build: &Build, metadata: &GBPMetadata) -> Result<(), Error> {
        let path = self.build_path(Content::Binpkgs, build).join("gbp.json");
        let json = serde_json::to_string_pretty(metadata).expect("GBPMetadata always serializes");
        fs::write(path, json)?;
        Ok(())
    }

    /// Remove every per-build tree for `build`. Missing paths are not an
    /// error. Does not repair dangling tag symlinks left behind.
    pub fn delete(&self, build: &Build) -> Result<(), Error> {
        for c in Content::ALL {
            let path = self.build_path(c, build);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Subdirectory names directly under `<build>/repos/`.
    pub fn repos(&self, build: &Build) -> Result<Vec<String>, Error> {
        let dir = self.build_path(Content::Repos, build);
        let mut names = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
