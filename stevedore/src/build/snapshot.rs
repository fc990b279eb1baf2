//! Filesystem snapshots of the staging root, diffed to find what a step
//! changed.
//!
//! Entries are compared by metadata only. `ctime` moves on any content or
//! metadata write and cannot be set from userspace, so a file rewritten
//! with identical size and mtime is still detected.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::images::archive::Change;
use stevedore_shared::{StevedoreError, StevedoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    kind: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: (i64, i64),
    ctime: (i64, i64),
    ino: u64,
    link: Option<PathBuf>,
}

/// State of every path under a root, keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, EntryState>,
}

impl Snapshot {
    pub fn capture(root: &Path) -> StevedoreResult<Self> {
        let mut entries = BTreeMap::new();
        if !root.exists() {
            return Ok(Self { entries });
        }

        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| {
                StevedoreError::Storage(format!("Failed to scan {}: {}", root.display(), e))
            })?;
            let meta = entry.metadata().map_err(|e| {
                StevedoreError::Storage(format!(
                    "Failed to stat {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            let link = if meta.file_type().is_symlink() {
                std::fs::read_link(entry.path()).ok()
            } else {
                None
            };
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| StevedoreError::Internal(e.to_string()))?
                .to_path_buf();
            entries.insert(
                rel,
                EntryState {
                    kind: meta.mode() & libc::S_IFMT,
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    size: if meta.is_dir() { 0 } else { meta.size() },
                    mtime: (meta.mtime(), meta.mtime_nsec()),
                    ctime: (meta.ctime(), meta.ctime_nsec()),
                    ino: meta.ino(),
                    link,
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes that turn `self` into `after`, in path order.
    ///
    /// A removed directory yields one deletion; its children are implied.
    pub fn diff(&self, after: &Snapshot) -> Vec<Change> {
        let mut changes = Vec::new();

        for (path, state) in &after.entries {
            match self.entries.get(path) {
                Some(previous) if previous == state => {}
                _ => changes.push(Change::Upsert(path.clone())),
            }
        }

        let mut deleted_dirs: Vec<&Path> = Vec::new();
        for (path, state) in &self.entries {
            if after.entries.contains_key(path) {
                continue;
            }
            if deleted_dirs.iter().any(|dir| path.starts_with(dir)) {
                continue;
            }
            if state.kind == libc::S_IFDIR {
                deleted_dirs.push(path);
            }
            changes.push(Change::Delete(path.clone()));
        }

        changes.sort();
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_no_change_no_diff() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a"), b"1").unwrap();
        let before = Snapshot::capture(temp.path()).unwrap();
        let after = Snapshot::capture(temp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn test_add_modify_delete() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("keep"), b"1").unwrap();
        fs::write(root.join("edit"), b"1").unwrap();
        fs::create_dir_all(root.join("gone/deep")).unwrap();
        fs::write(root.join("gone/deep/file"), b"1").unwrap();
        let before = Snapshot::capture(root).unwrap();

        fs::write(root.join("edit"), b"2").unwrap();
        fs::write(root.join("new"), b"1").unwrap();
        fs::remove_dir_all(root.join("gone")).unwrap();
        let after = Snapshot::capture(root).unwrap();

        let changes = before.diff(&after);
        assert!(changes.contains(&Change::Upsert("edit".into())));
        assert!(changes.contains(&Change::Upsert("new".into())));
        assert!(changes.contains(&Change::Delete("gone".into())));
        assert!(!changes.contains(&Change::Delete("gone/deep".into())));
        assert!(!changes.iter().any(|c| c.path() == Path::new("keep")));
    }

    #[test]
    fn test_same_size_rewrite_detected() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, b"aaaa").unwrap();
        let before = Snapshot::capture(temp.path()).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&file).unwrap());

        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&file, b"bbbb").unwrap();
        filetime::set_file_mtime(&file, mtime).unwrap();

        let after = Snapshot::capture(temp.path()).unwrap();
        assert_eq!(before.diff(&after), vec![Change::Upsert("f".into())]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let snapshot = Snapshot::capture(Path::new("/nonexistent/stevedore-root")).unwrap();
        assert!(snapshot.is_empty());
    }
}
