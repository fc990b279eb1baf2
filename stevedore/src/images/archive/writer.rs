//! Layer writer: packs a filesystem delta into a gzip tar blob.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::path::{Path, PathBuf};
use stevedore_shared::{StevedoreError, StevedoreResult};
use tempfile::NamedTempFile;

use super::tar::WHITEOUT_PREFIX;
use crate::util::digest;

/// One entry of a filesystem delta, relative to the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    /// Path was added or modified; its current state is packed.
    Upsert(PathBuf),
    /// Path was removed; packed as a `.wh.` whiteout.
    Delete(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Upsert(p) | Change::Delete(p) => p,
        }
    }
}

/// A finished, not yet committed layer blob.
#[derive(Debug)]
pub struct LayerBlob {
    pub file: NamedTempFile,
    pub digest: String,
    pub size: u64,
    pub entries: usize,
}

/// Pack `changes` (relative to `root`) into a gzip tar in `temp_dir`.
///
/// Entries are written in path order so parents precede children.
pub fn write_layer(root: &Path, changes: &[Change], temp_dir: &Path) -> StevedoreResult<LayerBlob> {
    let file = NamedTempFile::new_in(temp_dir)
        .map_err(|e| StevedoreError::Storage(format!("Failed to create layer file: {e}")))?;

    let encoder = GzEncoder::new(
        file.reopen()
            .map_err(|e| StevedoreError::Storage(format!("Failed to open layer file: {e}")))?,
        Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut ordered: Vec<&Change> = changes.iter().collect();
    ordered.sort_by(|a, b| a.path().cmp(b.path()));

    for change in &ordered {
        match change {
            Change::Upsert(rel) => {
                let full = root.join(rel);
                builder.append_path_with_name(&full, rel).map_err(|e| {
                    StevedoreError::Storage(format!(
                        "Failed to pack {}: {}",
                        full.display(),
                        e
                    ))
                })?;
            }
            Change::Delete(rel) => {
                let name = rel.file_name().ok_or_else(|| {
                    StevedoreError::Internal(format!("whiteout for root path {}", rel.display()))
                })?;
                let mut marker = std::ffi::OsString::from(WHITEOUT_PREFIX);
                marker.push(name);
                let marker_path = match rel.parent() {
                    Some(parent) => parent.join(marker),
                    None => PathBuf::from(marker),
                };

                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(0);
                builder
                    .append_data(&mut header, &marker_path, std::io::empty())
                    .map_err(|e| {
                        StevedoreError::Storage(format!(
                            "Failed to write whiteout {}: {}",
                            marker_path.display(),
                            e
                        ))
                    })?;
            }
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| StevedoreError::Storage(format!("Failed to finish layer tar: {e}")))?;
    let out = encoder
        .finish()
        .map_err(|e| StevedoreError::Storage(format!("Failed to finish layer gzip: {e}")))?;
    out.sync_all()
        .map_err(|e| StevedoreError::Storage(format!("Failed to sync layer file: {e}")))?;

    let size = fs::metadata(file.path())
        .map_err(|e| StevedoreError::Storage(format!("Failed to stat layer file: {e}")))?
        .len();
    let digest = digest::sha256_file(file.path())?;

    Ok(LayerBlob {
        file,
        digest,
        size,
        entries: ordered.len(),
    })
}
