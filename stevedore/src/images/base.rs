//! Base image resolution.
//!
//! Where base images come from is outside the builder's concern; it only
//! needs a root filesystem and a digest that pins it. `LocalBaseImages`
//! serves them from the store's `bases/` directory:
//!
//! ```text
//! bases/python/3.11-slim/           # unpacked root filesystem
//! bases/python_3.11-slim.tar.gz     # or an archive of one
//! ```

use std::path::{Path, PathBuf};

use crate::images::archive;
use crate::images::reference::ImageRef;
use crate::util::{digest, fs as fs_util};
use stevedore_shared::{StevedoreError, StevedoreResult};

/// Digest of the empty root filesystem.
pub const SCRATCH_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Where a base root filesystem is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRootfs {
    Scratch,
    Directory(PathBuf),
    Archive(PathBuf),
}

/// A resolved base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageRef,
    pub digest: String,
    pub rootfs: BaseRootfs,
}

impl BaseImage {
    pub fn scratch(reference: ImageRef) -> Self {
        Self {
            reference,
            digest: SCRATCH_DIGEST.to_string(),
            rootfs: BaseRootfs::Scratch,
        }
    }

    /// Lay the base root filesystem down into `dest`.
    pub fn materialize(&self, dest: &Path) -> StevedoreResult<()> {
        std::fs::create_dir_all(dest).map_err(|e| {
            StevedoreError::Storage(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        match &self.rootfs {
            BaseRootfs::Scratch => Ok(()),
            BaseRootfs::Directory(dir) => fs_util::copy_tree(dir, dest).map(|_| ()),
            BaseRootfs::Archive(path) => archive::apply_layer_file(path, dest).map(|_| ()),
        }
    }
}

/// Resolves base image references to root filesystems.
pub trait BaseImageSource: Send + Sync {
    /// Resolve `reference`. An error means the base is unavailable; the
    /// builder treats it as fatal and never retries.
    fn resolve(&self, reference: &ImageRef) -> StevedoreResult<BaseImage>;
}

/// Base images stored under a local directory.
#[derive(Debug, Clone)]
pub struct LocalBaseImages {
    root: PathBuf,
}

impl LocalBaseImages {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn directory_for(&self, reference: &ImageRef) -> PathBuf {
        self.root.join(reference.name()).join(reference.tag())
    }

    fn archive_candidates(&self, reference: &ImageRef) -> [PathBuf; 2] {
        let stem = format!("{}_{}", reference.name().replace('/', "_"), reference.tag());
        [
            self.root.join(format!("{stem}.tar.gz")),
            self.root.join(format!("{stem}.tar")),
        ]
    }
}

impl BaseImageSource for LocalBaseImages {
    fn resolve(&self, reference: &ImageRef) -> StevedoreResult<BaseImage> {
        if reference.is_scratch() {
            return Ok(BaseImage::scratch(reference.clone()));
        }

        let dir = self.directory_for(reference);
        if dir.is_dir() {
            let digest = digest::tree_digest(&dir)?;
            tracing::debug!(base = %reference, path = %dir.display(), %digest, "Resolved base directory");
            return Ok(BaseImage {
                reference: reference.clone(),
                digest,
                rootfs: BaseRootfs::Directory(dir),
            });
        }

        for candidate in self.archive_candidates(reference) {
            if candidate.is_file() {
                let digest = digest::sha256_file(&candidate)?;
                tracing::debug!(base = %reference, path = %candidate.display(), %digest, "Resolved base archive");
                return Ok(BaseImage {
                    reference: reference.clone(),
                    digest,
                    rootfs: BaseRootfs::Archive(candidate),
                });
            }
        }

        Err(StevedoreError::NotFound(format!(
            "base image {} not found under {}",
            reference,
            self.root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_always_resolves() {
        let source = LocalBaseImages::new(PathBuf::from("/nonexistent"));
        let base = source.resolve(&ImageRef::parse("scratch").unwrap()).unwrap();
        assert_eq!(base.rootfs, BaseRootfs::Scratch);
        assert_eq!(base.digest, SCRATCH_DIGEST);
    }

    #[test]
    fn test_directory_base_resolves_and_materializes() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("python/3.11-slim/usr/bin");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("python3"), b"#!fake").unwrap();

        let source = LocalBaseImages::new(temp.path().to_path_buf());
        let base = source
            .resolve(&ImageRef::parse("python:3.11-slim").unwrap())
            .unwrap();
        assert!(matches!(base.rootfs, BaseRootfs::Directory(_)));

        let dest = temp.path().join("out");
        base.materialize(&dest).unwrap();
        assert!(dest.join("usr/bin/python3").exists());
    }

    #[test]
    fn test_missing_base_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let source = LocalBaseImages::new(temp.path().to_path_buf());
        let err = source
            .resolve(&ImageRef::parse("python:9.9").unwrap())
            .unwrap_err();
        assert!(matches!(err, StevedoreError::NotFound(_)));
    }

    #[test]
    fn test_archive_base_digest_is_file_digest() {
        let temp = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("etc/os-release").unwrap();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"slim"[..]).unwrap();
        let archive_path = temp.path().join("debian_bookworm.tar");
        std::fs::write(&archive_path, builder.into_inner().unwrap()).unwrap();

        let source = LocalBaseImages::new(temp.path().to_path_buf());
        let base = source
            .resolve(&ImageRef::parse("debian:bookworm").unwrap())
            .unwrap();
        assert_eq!(base.digest, digest::sha256_file(&archive_path).unwrap());

        let dest = temp.path().join("rootfs");
        base.materialize(&dest).unwrap();
        assert_eq!(std::fs::read(dest.join("etc/os-release")).unwrap(), b"slim");
    }
}
