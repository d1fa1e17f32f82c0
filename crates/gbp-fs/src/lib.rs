//! Filesystem primitives shared by [`gbp_storage`](../gbp_storage): tar
//! extraction, rsync-style quick-check link-copy, and atomic symlink swap.

use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};
use tar::Archive as TarArchive;
use tracing::{debug, instrument, trace};

/// Untar `reader` into `dest`, creating `dest` if needed. Symlinks in the
/// archive are preserved as symlinks (the default `tar` unpack behaviour).
#[instrument(level = "trace", skip_all, fields(dest = %dest.display()))]
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create extraction dir {}", dest.display()))?;
    let mut archive = TarArchive::new(reader);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to unpack archive into {}", dest.display()))?;
    Ok(())
}

/// True if `a` and `b` are "the same file" per rsync's quick-check: neither
/// is a symlink, and both have identical size and modification time.
pub fn quick_check(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    if a.file_type().is_symlink() || b.file_type().is_symlink() {
        return false;
    }
    a.len() == b.len() && a.mtime() == b.mtime() && a.mtime_nsec() == b.mtime_nsec()
}

/// Copy the tree rooted at `src` into `dest`, recreating directory
/// structure and symlinks verbatim. Regular files are hardlinked from the
/// sibling path under `previous` when quick-check says they're unchanged;
/// otherwise the bytes are copied and the mtime preserved. With no
/// `previous`, every regular file is just copied (the caller may prefer
/// [`move_tree`] in that case, which is cheaper).
#[instrument(level = "trace", skip_all, fields(src = %src.display(), dest = %dest.display()))]
pub fn quick_check_copy_tree(src: &Path, dest: &Path, previous: Option<&Path>) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.context("failed to walk source tree")?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir always yields children of src");
        let dest_path = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest_path)
                .with_context(|| format!("failed to create {}", dest_path.display()))?;
            continue;
        }

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("failed to read symlink {}", entry.path().display()))?;
            if dest_path.symlink_metadata().is_ok() {
                fs::remove_file(&dest_path).ok();
            }
            std::os::unix::fs::symlink(&target, &dest_path)
                .with_context(|| format!("failed to create symlink {}", dest_path.display()))?;
            continue;
        }

        let src_meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        let prev_path = previous.map(|p| p.join(rel));
        let linked = match &prev_path {
            Some(prev_path) => match prev_path.symlink_metadata() {
                Ok(prev_meta) if quick_check(&src_meta, &prev_meta) => {
                    fs::hard_link(prev_path, &dest_path).is_ok()
                }
                _ => false,
            },
            None => false,
        };

        if linked {
            trace!(path = %rel.display(), "hardlinked from previous build");
        } else {
            fs::copy(entry.path(), &dest_path)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
            let mtime = filetime::FileTime::from_last_modification_time(&src_meta);
            filetime::set_file_mtime(&dest_path, mtime).ok();
            debug!(path = %rel.display(), "copied");
        }
    }
    Ok(())
}

/// Move `src` to `dest` via rename; falls back to quick-check copy-then-remove
/// if the two paths are on different filesystems.
pub fn move_tree(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).ok();
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            quick_check_copy_tree(src, dest, None)?;
            fs::remove_dir_all(src).ok();
            Ok(())
        }
    }
}

/// Atomically point `link` at `target`: create the symlink at a sibling
/// temporary path, then rename it over `link`. Never leaves `link` missing
/// or half-written; a crash before the rename leaves the old target intact,
/// a crash after leaves the new one.
pub fn atomic_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link
        .parent()
        .with_context(|| format!("{} has no parent directory", link.display()))?;
    fs::create_dir_all(parent).ok();

    let tmp_name = format!(
        ".{}.tmp-{}",
        link.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    );
    let tmp_path = parent.join(tmp_name);
    if tmp_path.symlink_metadata().is_ok() {
        fs::remove_file(&tmp_path).ok();
    }
    std::os::unix::fs::symlink(target, &tmp_path)
        .with_context(|| format!("failed to create symlink at {}", tmp_path.display()))?;
    fs::rename(&tmp_path, link)
        .with_context(|| format!("failed to swap symlink into place at {}", link.display()))?;
    Ok(())
}

/// Remove a symlink at `link` if present; a missing path is not an error.
pub fn remove_symlink_if_present(link: &Path) -> Result<()> {
    match fs::remove_file(link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove symlink {}", link.display())),
    }
}
