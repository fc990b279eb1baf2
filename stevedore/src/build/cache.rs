//! Build cache: step key → resulting layer.
//!
//! Keys chain: each step's key covers the previous key, the step's
//! canonical text and its inputs (base digest for `FROM`, content digest of
//! the copied files for `COPY`). Changing any step therefore invalidates it
//! and everything after it, and nothing before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::util::digest;
use stevedore_shared::{StevedoreError, StevedoreResult};

const CACHE_INDEX: &str = "index.json";

/// Key of the step before the first one.
pub const ROOT_KEY: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Key of a step following `previous`.
pub fn chain_key(previous: &str, canonical: &str, inputs: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    if let Some(inputs) = inputs {
        hasher.update(inputs.as_bytes());
    }
    digest::finish(hasher)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Layer digest, `None` for steps that change no files.
    pub layer: Option<String>,
    pub instruction: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: BTreeMap<String, CacheRecord>,
}

/// Persistent step cache of one store.
#[derive(Debug)]
pub struct BuildCache {
    dir: PathBuf,
    index: CacheIndex,
}

impl BuildCache {
    /// Load the cache; a missing or unreadable index starts empty.
    pub fn open(dir: &Path) -> StevedoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StevedoreError::Storage(format!("failed to create {}: {e}", dir.display()))
        })?;
        let path = dir.join(CACHE_INDEX);
        let index = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Corrupted build cache index, starting empty: {}", e);
                CacheIndex::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
            Err(e) => {
                tracing::warn!("Failed to read build cache index, starting empty: {}", e);
                CacheIndex::default()
            }
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    pub fn get(&self, key: &str) -> Option<&CacheRecord> {
        self.index.entries.get(key)
    }

    /// Record a step result and persist the index.
    pub fn insert(&mut self, key: String, record: CacheRecord) -> StevedoreResult<()> {
        self.index.entries.insert(key, record);
        self.save()
    }

    /// Drop an entry whose layer vanished from the store.
    pub fn invalidate(&mut self, key: &str) -> StevedoreResult<()> {
        if self.index.entries.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    fn save(&self) -> StevedoreResult<()> {
        let path = self.dir.join(CACHE_INDEX);
        let tmp = self.dir.join(format!("{CACHE_INDEX}.tmp"));
        let json = serde_json::to_string_pretty(&self.index)
            .map_err(|e| StevedoreError::Storage(format!("failed to serialize cache: {e}")))?;
        std::fs::write(&tmp, json)
            .map_err(|e| StevedoreError::Storage(format!("failed to write cache: {e}")))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| StevedoreError::Storage(format!("failed to replace cache: {e}")))
    }
}
