//! `COPY` from the build context into the staging root.

use sha2::Sha256;
use std::path::{Path, PathBuf};

use super::recipe::is_contained;
use crate::util::{digest, fs as fs_util};
use stevedore_shared::{BuildError, StevedoreError, StevedoreResult};

/// Resolve a COPY source inside the context, refusing anything that
/// escapes it (including through symlinks).
pub fn resolve_source(context: &Path, source: &str) -> StevedoreResult<PathBuf> {
    let copy_error = |reason: String| BuildError::CopySource {
        source_path: source.to_string(),
        reason,
    };

    if !is_contained(source) {
        return Err(copy_error("must be a relative path inside the build context".into()).into());
    }
    let path = context.join(source);
    let resolved = path
        .canonicalize()
        .map_err(|e| copy_error(format!("not found in build context: {e}")))?;
    let context = context
        .canonicalize()
        .map_err(|e| copy_error(format!("build context unavailable: {e}")))?;
    if !resolved.starts_with(&context) {
        return Err(copy_error("resolves outside the build context".into()).into());
    }
    Ok(path)
}

/// Content digest of the sources, used as the step's cache input.
pub fn sources_digest(context: &Path, sources: &[String]) -> StevedoreResult<String> {
    let mut hasher = <Sha256 as sha2::Digest>::new();
    for source in sources {
        let path = resolve_source(context, source)?;
        digest::hash_tree(&mut hasher, &path, source)?;
    }
    Ok(digest::finish(hasher))
}

/// Resolve `path` against `base` inside the image, lexically. `..` never
/// climbs above `/`, so the result is always absolute and normalized.
pub fn resolve_image_path(base: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') {
        path.split('/').collect::<Vec<_>>()
    } else {
        base.split('/').chain(path.split('/')).collect()
    };
    for part in joined {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Where `dest` lands on the host, given the image working directory.
pub fn destination(rootfs: &Path, workdir: &str, dest: &str) -> PathBuf {
    let inside = resolve_image_path(workdir, dest);
    rootfs.join(inside.trim_start_matches('/'))
}

/// Copy every source to `dest`. Directory sources are merged into the
/// destination directory; a file goes into it when the destination names
/// a directory (trailing `/`, `.`, an existing directory, or several
/// sources) and to the exact path otherwise.
pub fn copy_sources(
    context: &Path,
    sources: &[String],
    rootfs: &Path,
    workdir: &str,
    dest: &str,
) -> StevedoreResult<u64> {
    let target = destination(rootfs, workdir, dest);
    let dest_is_dir = dest.ends_with('/')
        || dest == "."
        || target.is_dir()
        || sources.len() > 1;

    let mut copied = 0;
    for source in sources {
        let path = resolve_source(context, source)?;
        let file_target = if path.is_dir() {
            target.clone()
        } else if dest_is_dir {
            let name = path.file_name().ok_or_else(|| {
                StevedoreError::InvalidArgument(format!("COPY source '{source}' has no file name"))
            })?;
            target.join(name)
        } else {
            target.clone()
        };

        if let Some(parent) = file_target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StevedoreError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        copied += fs_util::copy_tree(&path, &file_target)?;
        tracing::debug!(source, target = %file_target.display(), "Copied");
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn context() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("requirements.txt"), "foo==1.0\n").unwrap();
        fs::create_dir_all(temp.path().join("app")).unwrap();
        fs::write(temp.path().join("app/main.py"), "app = None\n").unwrap();
        temp
    }

    #[test]
    fn test_copy_file_into_workdir() {
        let ctx = context();
        let root = tempfile::tempdir().unwrap();
        copy_sources(ctx.path(), &["requirements.txt".into()], root.path(), "/app", ".").unwrap();
        assert!(root.path().join("app/requirements.txt").is_file());
    }

    #[test]
    fn test_copy_whole_context() {
        let ctx = context();
        let root = tempfile::tempdir().unwrap();
        copy_sources(ctx.path(), &[".".into()], root.path(), "/app", ".").unwrap();
        assert!(root.path().join("app/app/main.py").is_file());
        assert!(root.path().join("app/requirements.txt").is_file());
    }

    #[test]
    fn test_copy_file_to_exact_path() {
        let ctx = context();
        let root = tempfile::tempdir().unwrap();
        copy_sources(ctx.path(), &["requirements.txt".into()], root.path(), "/", "/etc/reqs.txt")
            .unwrap();
        assert!(root.path().join("etc/reqs.txt").is_file());
    }

    #[rstest::rstest]
    #[case("/", "/../../etc", "/etc")]
    #[case("/app", "../../..", "/")]
    #[case("/app", "./src/../lib/", "/app/lib")]
    #[case("/app/", "data", "/app/data")]
    #[case("/a/b", "/c/./d/..", "/c")]
    fn test_resolve_image_path(#[case] base: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(resolve_image_path(base, path), expected);
    }

    #[test]
    fn test_destination_stays_under_rootfs() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(destination(root.path(), "/", "/../../etc"), root.path().join("etc"));
        assert_eq!(destination(root.path(), "/app", "../.."), root.path().to_path_buf());
    }

    #[test]
    fn test_copy_with_parent_dest_lands_inside_rootfs() {
        let ctx = context();
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("rootfs");
        fs::create_dir_all(&root).unwrap();

        copy_sources(ctx.path(), &["requirements.txt".into()], &root, "/app", "/../escaped.txt")
            .unwrap();
        assert!(root.join("escaped.txt").is_file());
        assert!(!outer.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_missing_source() {
        let ctx = context();
        let err = sources_digest(ctx.path(), &["nope.txt".into()]).unwrap_err();
        assert!(matches!(
            err,
            StevedoreError::Build(BuildError::CopySource { .. })
        ));
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let ctx = context();
        std::os::unix::fs::symlink("/etc", ctx.path().join("escape")).unwrap();
        assert!(resolve_source(ctx.path(), "escape").is_err());
    }

    #[test]
    fn test_digest_tracks_content_not_mtime() {
        let ctx = context();
        let sources = vec!["requirements.txt".to_string()];
        let before = sources_digest(ctx.path(), &sources).unwrap();

        let file = ctx.path().join("requirements.txt");
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1, 0)).unwrap();
        assert_eq!(sources_digest(ctx.path(), &sources).unwrap(), before);

        fs::write(&file, "foo==2.0\n").unwrap();
        assert_ne!(sources_digest(ctx.path(), &sources).unwrap(), before);
    }
}
