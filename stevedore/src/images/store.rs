//! Thread-safe image store.
//!
//! `ImageStore` owns the on-disk index and the content-addressed layer
//! blobs under one home directory. Locking is internal: callers share the
//! store behind an `Arc` and never see the lock.
//!
//! Layers and images have independent lifetimes. Removing an image drops
//! its index entry only; its layers stay in the store and keep serving as
//! cache hits for later builds.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use crate::images::archive::{self, LayerBlob};
use crate::images::base::BaseImageSource;
use crate::images::index::ImageIndex;
use crate::images::record::ImageRecord;
use crate::runtime::layout::FilesystemLayout;
use crate::util::digest;
use stevedore_shared::{StevedoreError, StevedoreResult};

pub struct ImageStore {
    layout: FilesystemLayout,
    index: RwLock<ImageIndex>,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("home", &self.layout.home_dir())
            .finish()
    }
}

impl ImageStore {
    /// Open (and create if needed) the store rooted at `layout`.
    pub fn open(layout: FilesystemLayout) -> StevedoreResult<Self> {
        layout.prepare()?;
        let index = ImageIndex::load(&layout.images_dir())?;
        Ok(Self {
            layout,
            index: RwLock::new(index),
        })
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.layout
    }

    // ========================================================================
    // LAYERS
    // ========================================================================

    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.layout.layer_path(digest)
    }

    pub fn has_layer(&self, digest: &str) -> bool {
        self.layer_path(digest).is_file()
    }

    /// Move a finished blob into the store under its digest.
    ///
    /// Committing a digest that is already present is a no-op; the
    /// temporary blob is discarded.
    pub fn commit_layer(&self, blob: LayerBlob) -> StevedoreResult<String> {
        let target = self.layer_path(&blob.digest);
        if target.is_file() {
            tracing::debug!(digest = %blob.digest, "Layer already stored");
            return Ok(blob.digest);
        }

        blob.file.persist(&target).map_err(|e| {
            StevedoreError::Storage(format!(
                "Failed to store layer {}: {}",
                target.display(),
                e.error
            ))
        })?;
        tracing::debug!(
            digest = %blob.digest,
            size = blob.size,
            entries = blob.entries,
            "Committed layer"
        );
        Ok(blob.digest)
    }

    /// Re-hash a stored blob and compare against its name.
    ///
    /// Returns `Ok(false)` for a missing or corrupted blob.
    pub fn verify_layer(&self, digest: &str) -> StevedoreResult<bool> {
        let path = self.layer_path(digest);
        if !path.is_file() {
            return Ok(false);
        }
        let actual = digest::sha256_file(&path)?;
        if actual != digest {
            tracing::warn!(expected = %digest, %actual, "Layer digest mismatch");
            return Ok(false);
        }
        Ok(true)
    }

    // ========================================================================
    // IMAGES
    // ========================================================================

    /// Record an image, replacing any previous image with the same tag.
    pub fn save(&self, record: ImageRecord) -> StevedoreResult<()> {
        for layer in &record.layers {
            if !self.has_layer(layer) {
                return Err(StevedoreError::Image(format!(
                    "image {} references missing layer {}",
                    record.tag, layer
                )));
            }
        }

        let mut index = self.index.write();
        let tag = record.tag.clone();
        if let Some(previous) = index.upsert(record)
            && let Some(current) = index.get(&tag)
            && previous.id != current.id
        {
            tracing::info!(%tag, old = %previous.short_id(), new = %current.short_id(), "Retagged image");
        }
        index.save(&self.layout.images_dir())
    }

    pub fn get(&self, tag: &str) -> Option<ImageRecord> {
        self.index.read().get(tag).cloned()
    }

    /// All images, sorted by tag.
    pub fn list(&self) -> Vec<ImageRecord> {
        self.index.read().images.values().cloned().collect()
    }

    /// Remove an image record. Its layers stay cached.
    pub fn remove(&self, tag: &str) -> StevedoreResult<ImageRecord> {
        let mut index = self.index.write();
        let removed = index
            .remove(tag)
            .ok_or_else(|| StevedoreError::NotFound(format!("image {tag}")))?;
        index.save(&self.layout.images_dir())?;
        tracing::info!(%tag, id = %removed.short_id(), "Removed image");
        Ok(removed)
    }

    /// Materialize the full root filesystem of an image into `dest`.
    ///
    /// The base is resolved again through `bases` and must still carry the
    /// digest the image was built on.
    pub fn export(
        &self,
        tag: &str,
        dest: &Path,
        bases: &dyn BaseImageSource,
    ) -> StevedoreResult<ImageRecord> {
        let record = self
            .get(tag)
            .ok_or_else(|| StevedoreError::NotFound(format!("image {tag}")))?;

        let base = bases.resolve(&record.base.reference)?;
        if base.digest != record.base.digest {
            return Err(StevedoreError::Image(format!(
                "base {} changed since {} was built ({} != {})",
                record.base.reference, tag, base.digest, record.base.digest
            )));
        }
        base.materialize(dest)?;

        for layer in &record.layers {
            let path = self.layer_path(layer);
            if !path.is_file() {
                return Err(StevedoreError::Image(format!("layer {layer} missing from store")));
            }
            archive::apply_layer_file(&path, dest)?;
        }

        tracing::info!(%tag, dest = %dest.display(), layers = record.layers.len(), "Exported image");
        Ok(record)
    }
}
