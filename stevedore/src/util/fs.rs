//! Filesystem copy helpers for base materialisation and COPY steps.

use filetime::{FileTime, set_file_times, set_symlink_file_times};
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use stevedore_shared::{StevedoreError, StevedoreResult};
use walkdir::WalkDir;

/// Copy `src` (file, symlink or directory) to `dst`.
///
/// Directories are merged into an existing `dst`; files and symlinks replace
/// what is there. Permission bits and modification times are preserved,
/// symlinks are copied as links.
pub fn copy_tree(src: &Path, dst: &Path) -> StevedoreResult<u64> {
    let meta = fs::symlink_metadata(src).map_err(|e| {
        StevedoreError::Storage(format!("Failed to stat {}: {}", src.display(), e))
    })?;

    if !meta.is_dir() {
        return copy_entry(src, dst, &meta);
    }

    let mut copied = 0u64;
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            StevedoreError::Storage(format!("Failed to walk {}: {}", src.display(), e))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let meta = fs::symlink_metadata(entry.path()).map_err(|e| {
            StevedoreError::Storage(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;

        if meta.is_dir() {
            if !target.is_dir() {
                remove_path(&target)?;
                fs::create_dir_all(&target).map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to create directory {}: {}",
                        target.display(),
                        e
                    ))
                })?;
            }
            dirs.push((target, meta));
        } else {
            copied += copy_entry(entry.path(), &target, &meta)?;
        }
    }

    // Directory metadata last and deepest first, so writing children does
    // not bump parent mtimes afterwards.
    dirs.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (dir, meta) in dirs {
        apply_metadata(&dir, &meta)?;
    }

    Ok(copied)
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> StevedoreResult<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    remove_path(dst)?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).map_err(|e| {
            StevedoreError::Storage(format!("Failed to read link {}: {}", src.display(), e))
        })?;
        symlink(&target, dst).map_err(|e| {
            StevedoreError::Storage(format!("Failed to create symlink {}: {}", dst.display(), e))
        })?;
        let mtime = FileTime::from_last_modification_time(meta);
        set_symlink_file_times(dst, mtime, mtime).ok();
        return Ok(0);
    }

    if !meta.is_file() {
        tracing::debug!(path = %src.display(), "Skipping special file");
        return Ok(0);
    }

    let bytes = fs::copy(src, dst).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to copy {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;
    apply_metadata(dst, meta)?;
    Ok(bytes)
}

fn apply_metadata(path: &Path, meta: &fs::Metadata) -> StevedoreResult<()> {
    let mode = meta.permissions().mode() & 0o7777;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        StevedoreError::Storage(format!("Failed to chmod {}: {}", path.display(), e))
    })?;
    let atime = FileTime::from_last_access_time(meta);
    let mtime = FileTime::from_last_modification_time(meta);
    set_file_times(path, atime, mtime).map_err(|e| {
        StevedoreError::Storage(format!("Failed to set times on {}: {}", path.display(), e))
    })
}

/// Remove a file, symlink or directory tree if present.
pub fn remove_path(path: &Path) -> StevedoreResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    }
    .map_err(|e| StevedoreError::Storage(format!("Failed to remove {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_tree_merges_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("pkg")).unwrap();
        fs::write(src.path().join("pkg/mod.py"), b"x = 1").unwrap();
        symlink("pkg/mod.py", src.path().join("link")).unwrap();
        fs::write(dst.path().join("keep.txt"), b"keep").unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("pkg/mod.py")).unwrap(), b"x = 1");
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            Path::new("pkg/mod.py")
        );
        assert!(dst.path().join("keep.txt").exists());
    }

    #[test]
    fn test_copy_preserves_mode() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        copy_tree(&script, &dst.path().join("run.sh")).unwrap();

        let mode = fs::metadata(dst.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_remove_path_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("nope")).unwrap();
    }
}
