use std::path::{Path, PathBuf};
use stevedore_shared::{StevedoreError, StevedoreResult};

/// Directory structure constants
pub mod dirs {
    /// Base directory name under the user's home
    pub const STEVEDORE_DIR: &str = ".stevedore";

    /// Image records and manifests
    pub const IMAGES_DIR: &str = "images";

    /// Layer blobs (`sha256-<hex>.tar.gz`)
    pub const LAYERS_DIR: &str = "layers";

    /// Build cache index
    pub const CACHE_DIR: &str = "cache";

    /// Locally provided base images
    pub const BASES_DIR: &str = "bases";

    /// Staging roots for in-progress builds
    pub const TMP_DIR: &str = "tmp";

    /// Log files
    pub const LOGS_DIR: &str = "logs";
}

/// Filesystem layout of a stevedore home directory.
///
/// ```text
/// ~/.stevedore/
/// ├── .lock
/// ├── images/index.json
/// ├── layers/sha256-<hex>.tar.gz
/// ├── cache/index.json
/// ├── bases/<name>/<tag>/ | bases/<name>_<tag>.tar[.gz]
/// ├── tmp/
/// └── logs/
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES_DIR)
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LAYERS_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::CACHE_DIR)
    }

    pub fn bases_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::BASES_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    /// Temporary directory on the same filesystem as the layer store, so
    /// finished blobs can be renamed into place atomically.
    pub fn temp_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TMP_DIR)
    }

    /// Path of a layer blob for a `sha256:<hex>` digest.
    pub fn layer_path(&self, digest: &str) -> PathBuf {
        let filename = digest.replace(':', "-");
        self.layers_dir().join(format!("{filename}.tar.gz"))
    }

    /// Create the directory structure.
    pub fn prepare(&self) -> StevedoreResult<()> {
        for dir in [
            self.home_dir.clone(),
            self.images_dir(),
            self.layers_dir(),
            self.cache_dir(),
            self.bases_dir(),
            self.temp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StevedoreError::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_tree() {
        let temp = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(temp.path().join("home"));
        layout.prepare().unwrap();

        assert!(layout.images_dir().is_dir());
        assert!(layout.layers_dir().is_dir());
        assert!(layout.cache_dir().is_dir());
        assert!(layout.bases_dir().is_dir());
        assert!(layout.temp_dir().is_dir());

        // Idempotent
        layout.prepare().unwrap();
    }

    #[test]
    fn test_layer_path_replaces_colon() {
        let layout = FilesystemLayout::new(PathBuf::from("/h"));
        assert_eq!(
            layout.layer_path("sha256:abc"),
            PathBuf::from("/h/layers/sha256-abc.tar.gz")
        );
    }
}
