//! Streaming layer applier.
//!
//! Applies a (optionally gzip-compressed) tar layer onto a root directory,
//! honouring OCI whiteouts: `.wh.<name>` deletes `<name>` from lower layers
//! and `.wh..wh..opq` clears a directory of everything not unpacked by the
//! current layer.

use filetime::{FileTime, set_file_times, set_symlink_file_times};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use stevedore_shared::{StevedoreError, StevedoreResult};
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace};
use walkdir::WalkDir;

pub(super) const WHITEOUT_PREFIX: &str = ".wh.";
pub(super) const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Apply a layer file into `dest`, detecting gzip by its magic number.
///
/// Returns the total size of the entries applied.
pub fn apply_layer_file(tarball_path: &Path, dest: &Path) -> StevedoreResult<u64> {
    let open = || {
        fs::File::open(tarball_path).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to open layer tarball {}: {}",
                tarball_path.display(),
                e
            ))
        })
    };

    let mut header = [0u8; 2];
    let is_gzip = match open()?.take(2).read_exact(&mut header) {
        Ok(()) => header == [0x1f, 0x8b],
        // Shorter than two bytes: cannot be gzip, let tar report it.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => {
            return Err(StevedoreError::Storage(format!(
                "Failed to read layer header: {e}"
            )));
        }
    };

    let reader: Box<dyn Read> = if is_gzip {
        debug!("Detected gzip compression for {}", tarball_path.display());
        Box::new(GzDecoder::new(BufReader::new(open()?)))
    } else {
        debug!(
            "Detected uncompressed tarball for {}",
            tarball_path.display()
        );
        Box::new(BufReader::new(open()?))
    };

    apply_layer(reader, dest)
}

struct DirMeta {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

struct DeferredHardlink {
    link_path: PathBuf,
    target_path: PathBuf,
}

/// Apply an uncompressed tar stream into `dest`.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> StevedoreResult<u64> {
    fs::create_dir_all(dest).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to create destination directory {}: {}",
            dest.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(reader);
    let mut unpacked_paths = HashSet::new();
    let mut total_size = 0u64;
    let mut deferred_dirs: Vec<DirMeta> = Vec::new();
    let mut deferred_hardlinks: Vec<DeferredHardlink> = Vec::new();

    for entry_result in archive
        .entries()
        .map_err(|e| StevedoreError::Storage(format!("Tar read entries error: {}", e)))?
    {
        let mut entry = entry_result
            .map_err(|e| StevedoreError::Storage(format!("Tar read entry error: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| StevedoreError::Storage(format!("Tar parse header path error: {}", e)))?
            .into_owned();
        let normalized = match normalize_entry_path(&raw_path) {
            Some(p) => p,
            None => {
                debug!("Skipping path outside root: {}", raw_path.display());
                continue;
            }
        };

        if normalized.as_os_str().is_empty() {
            continue;
        }

        let full_path = dest.join(&normalized);
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o755);
        let mtime = entry.header().mtime().unwrap_or(0);
        total_size = total_size.saturating_add(entry.header().size().unwrap_or(0));

        trace!(
            path = %normalized.display(),
            ?entry_type,
            mode = format!("{:o}", mode),
            "Processing entry"
        );

        if handle_whiteout(&full_path, &unpacked_paths, entry_type)? {
            continue;
        }

        ensure_parent_dirs(&full_path)?;
        remove_existing_if_needed(&full_path, entry_type)?;

        match entry_type {
            EntryType::Directory => {
                create_dir(&full_path)?;
                deferred_dirs.push(DirMeta {
                    path: full_path.clone(),
                    mode,
                    mtime,
                });
            }
            EntryType::Regular | EntryType::GNUSparse => {
                create_regular_file(&mut entry, &full_path, mode)?;
                apply_permissions_and_times(&full_path, entry_type, mode, mtime)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| StevedoreError::Storage(format!("Tar read link name error: {e}")))?
                    .ok_or_else(|| {
                        StevedoreError::Storage(format!(
                            "Symlink without target: {}",
                            raw_path.display()
                        ))
                    })?
                    .into_owned();
                std::os::unix::fs::symlink(&target, &full_path).map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to create symlink {}: {}",
                        full_path.display(),
                        e
                    ))
                })?;
                apply_permissions_and_times(&full_path, entry_type, mode, mtime)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| StevedoreError::Storage(format!("Tar read link name error: {e}")))?
                    .ok_or_else(|| {
                        StevedoreError::Storage(format!(
                            "Hardlink without target: {}",
                            raw_path.display()
                        ))
                    })?
                    .into_owned();
                let target_path = resolve_hardlink_target(dest, &target)?;
                if target_path.exists() {
                    create_hardlink(&full_path, &target_path)?;
                } else {
                    deferred_hardlinks.push(DeferredHardlink {
                        link_path: full_path.clone(),
                        target_path,
                    });
                }
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                // Device nodes and fifos need privileges a build store
                // does not have; skip them.
                debug!(
                    "Skipping unsupported entry {:?} for {}",
                    other,
                    raw_path.display()
                );
                continue;
            }
        }

        unpacked_paths.insert(full_path);
    }

    for deferred in deferred_hardlinks {
        if deferred.target_path.exists() {
            create_hardlink(&deferred.link_path, &deferred.target_path)?;
        } else {
            trace!(
                "Skipping deferred hardlink {} -> {} (target does not exist)",
                deferred.link_path.display(),
                deferred.target_path.display()
            );
        }
    }

    // Deepest first so a restrictive parent mode does not block children.
    deferred_dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
    for dir in &deferred_dirs {
        if dir.path.exists() {
            apply_permissions_and_times(&dir.path, EntryType::Directory, dir.mode, dir.mtime)?;
        }
    }

    Ok(total_size)
}

fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => continue,
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

fn ensure_parent_dirs(path: &Path) -> StevedoreResult<()> {
    if let Some(parent) = path.parent()
        && !parent.is_dir()
    {
        fs::create_dir_all(parent).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to create parent directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn handle_whiteout(
    path: &Path,
    unpacked: &HashSet<PathBuf>,
    entry_type: EntryType,
) -> StevedoreResult<bool> {
    if entry_type != EntryType::Regular {
        return Ok(false);
    }

    let base = match path.file_name().and_then(|n| n.to_str()) {
        Some(b) => b,
        None => return Ok(false),
    };

    if base == OPAQUE_WHITEOUT {
        let dir = path
            .parent()
            .ok_or_else(|| StevedoreError::Storage("Opaque marker without parent".into()))?;
        apply_opaque_whiteout(dir, unpacked)?;
        return Ok(true);
    }

    if let Some(target_name) = base.strip_prefix(WHITEOUT_PREFIX) {
        let parent = path
            .parent()
            .ok_or_else(|| StevedoreError::Storage("Whiteout without parent directory".into()))?;
        let target = parent.join(target_name);
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(&target).ok();
            }
            Ok(_) => {
                fs::remove_file(&target).ok();
            }
            Err(_) => {}
        }
        debug!("Whiteout removed {}", target.display());
        return Ok(true);
    }

    Ok(false)
}

fn apply_opaque_whiteout(dir: &Path, unpacked: &HashSet<PathBuf>) -> StevedoreResult<()> {
    if !dir.exists() {
        return Ok(());
    }

    let children: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect();

    for target in children {
        if unpacked.contains(&target) {
            continue;
        }
        if target.is_dir() && !target.is_symlink() {
            fs::remove_dir_all(&target).ok();
        } else {
            fs::remove_file(&target).ok();
        }
        debug!("Opaque whiteout removed {}", target.display());
    }
    Ok(())
}

fn remove_existing_if_needed(path: &Path, entry_type: EntryType) -> StevedoreResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_dir() && entry_type == EntryType::Directory {
                return Ok(());
            }
            fs::remove_file(path)
                .or_else(|_| fs::remove_dir_all(path))
                .map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to remove existing path {}: {}",
                        path.display(),
                        e
                    ))
                })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(StevedoreError::Storage(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            )));
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> StevedoreResult<()> {
    fs::create_dir_all(path).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

fn create_regular_file<R: Read>(
    entry: &mut Entry<R>,
    path: &Path,
    mode: u32,
) -> StevedoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777 | 0o200)
        .open(path)
        .map_err(|e| {
            StevedoreError::Storage(format!("Failed to create file {}: {}", path.display(), e))
        })?;
    io::copy(entry, &mut file).map_err(|e| {
        StevedoreError::Storage(format!("Failed to write file {}: {}", path.display(), e))
    })?;
    Ok(())
}

fn create_hardlink(path: &Path, target: &Path) -> StevedoreResult<()> {
    fs::hard_link(target, path).map_err(|e| {
        StevedoreError::Storage(format!(
            "Failed to create hardlink {} -> {}: {}",
            path.display(),
            target.display(),
            e
        ))
    })
}

fn resolve_hardlink_target(root: &Path, linkname: &Path) -> StevedoreResult<PathBuf> {
    let normalized = normalize_entry_path(linkname).ok_or_else(|| {
        StevedoreError::Storage(format!(
            "Hardlink target escapes root: {}",
            linkname.display()
        ))
    })?;
    Ok(root.join(normalized))
}

fn apply_permissions_and_times(
    path: &Path,
    entry_type: EntryType,
    mode: u32,
    mtime: u64,
) -> StevedoreResult<()> {
    let time = FileTime::from_unix_time(mtime as i64, 0);
    if entry_type == EntryType::Symlink {
        set_symlink_file_times(path, time, time).ok();
        return Ok(());
    }

    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).map_err(|e| {
        StevedoreError::Storage(format!("Failed to chmod {}: {}", path.display(), e))
    })?;
    set_file_times(path, time, time).map_err(|e| {
        StevedoreError::Storage(format!("Failed to set times on {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    enum TestEntry {
        Dir(&'static str),
        File(&'static str, &'static [u8]),
        Symlink(&'static str, &'static str),
        Hardlink(&'static str, &'static str),
    }

    fn create_test_tar(entries: Vec<TestEntry>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TestEntry::Dir(path) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o755);
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::File(path, content) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, content).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Hardlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_mode(0o644);
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_apply_gzip_layer_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("root");
        let tarball = temp.path().join("layer.tar.gz");
        let data = create_test_tar(vec![
            TestEntry::Dir("app"),
            TestEntry::File("app/main.py", b"app = None\n"),
            TestEntry::Symlink("app/current", "main.py"),
        ]);
        fs::write(&tarball, gzip(&data)).unwrap();

        apply_layer_file(&tarball, &dest).unwrap();

        assert_eq!(fs::read(dest.join("app/main.py")).unwrap(), b"app = None\n");
        assert_eq!(
            fs::read_link(dest.join("app/current")).unwrap(),
            Path::new("main.py")
        );
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path();
        fs::create_dir_all(dest.join("etc")).unwrap();
        fs::write(dest.join("etc/old.conf"), b"old").unwrap();
        fs::write(dest.join("etc/keep.conf"), b"keep").unwrap();

        let data = create_test_tar(vec![TestEntry::File("etc/.wh.old.conf", b"")]);
        apply_layer(&data[..], dest).unwrap();

        assert!(!dest.join("etc/old.conf").exists());
        assert!(!dest.join("etc/.wh.old.conf").exists());
        assert!(dest.join("etc/keep.conf").exists());
    }

    #[test]
    fn test_opaque_whiteout_keeps_only_new_entries() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path();
        fs::create_dir_all(dest.join("cache")).unwrap();
        fs::write(dest.join("cache/stale"), b"x").unwrap();

        let data = create_test_tar(vec![
            TestEntry::Dir("cache"),
            TestEntry::File("cache/fresh", b"y"),
            TestEntry::File("cache/.wh..wh..opq", b""),
        ]);
        apply_layer(&data[..], dest).unwrap();

        assert!(!dest.join("cache/stale").exists());
        assert!(dest.join("cache/fresh").exists());
    }

    #[test]
    fn test_deferred_hardlink_target_appears_later() {
        let temp = tempfile::tempdir().unwrap();
        let data = create_test_tar(vec![
            TestEntry::Hardlink("link-to-target", "target.txt"),
            TestEntry::File("target.txt", b"target content"),
        ]);
        apply_layer(&data[..], temp.path()).unwrap();
        assert_eq!(
            fs::read(temp.path().join("link-to-target")).unwrap(),
            b"target content"
        );
    }

    #[test]
    fn test_paths_outside_root_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("root");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        // set_path refuses "..", so write the raw name bytes.
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../escape");
        header.set_mode(0o644);
        header.set_size(1);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        apply_layer(&data[..], &dest).unwrap();
        assert!(!temp.path().join("escape").exists());
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("/a/./b")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/../b")),
            Some(PathBuf::from("b"))
        );
        assert_eq!(normalize_entry_path(Path::new("../x")), None);
    }
}
