//! Image index: tag → image record, persisted as JSON.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::images::record::ImageRecord;
use stevedore_shared::{StevedoreError, StevedoreResult};

const INDEX_FILE: &str = "index.json";

/// Index of built images, keyed by tag.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageIndex {
    /// Schema version for future compatibility
    pub version: String,

    pub images: BTreeMap<String, ImageRecord>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            images: BTreeMap::new(),
        }
    }

    /// Load index from disk.
    ///
    /// Returns empty index if file doesn't exist or is corrupted.
    pub fn load(images_dir: &Path) -> StevedoreResult<Self> {
        let index_path = images_dir.join(INDEX_FILE);

        if !index_path.exists() {
            tracing::debug!("Image index not found, starting empty");
            return Ok(Self::new());
        }

        match std::fs::read_to_string(&index_path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(index) => {
                    tracing::debug!("Loaded index with {} images", index.len());
                    Ok(index)
                }
                Err(e) => {
                    tracing::warn!("Corrupted image index, starting empty: {}", e);
                    Ok(Self::new())
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read image index, starting empty: {}", e);
                Ok(Self::new())
            }
        }
    }

    /// Save index to disk (write to temp file, then rename).
    pub fn save(&self, images_dir: &Path) -> StevedoreResult<()> {
        let index_path = images_dir.join(INDEX_FILE);
        let tmp_path = images_dir.join(format!("{INDEX_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StevedoreError::Storage(format!("failed to serialize index: {e}")))?;

        std::fs::write(&tmp_path, json)
            .map_err(|e| StevedoreError::Storage(format!("failed to write index: {e}")))?;
        std::fs::rename(&tmp_path, &index_path)
            .map_err(|e| StevedoreError::Storage(format!("failed to replace index: {e}")))?;

        tracing::debug!("Saved index with {} images", self.images.len());
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&ImageRecord> {
        self.images.get(tag)
    }

    /// Add or replace the image for a tag.
    pub fn upsert(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        self.images.insert(record.tag.clone(), record)
    }

    pub fn remove(&mut self, tag: &str) -> Option<ImageRecord> {
        self.images.remove(tag)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
