//! Content digests used for layer names and cache keys.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use stevedore_shared::{StevedoreError, StevedoreResult};
use walkdir::WalkDir;

/// Format a finished hasher as `sha256:<hex>`.
pub fn finish(hasher: Sha256) -> String {
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finish(hasher)
}

/// `sha256:<hex>` of a file's contents, streamed.
pub fn sha256_file(path: &Path) -> StevedoreResult<String> {
    let mut file = fs::File::open(path).map_err(|e| {
        StevedoreError::Storage(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    copy_into(&mut file, &mut hasher)
        .map_err(|e| StevedoreError::Storage(format!("Failed to hash {}: {}", path.display(), e)))?;
    Ok(finish(hasher))
}

/// Feed a directory tree (or a single file) into `hasher`.
///
/// Covers relative paths, entry kinds, permission bits, file contents and
/// symlink targets. Timestamps and ownership are left out, so touching a
/// file without changing it keeps the digest stable.
pub fn hash_tree(hasher: &mut Sha256, root: &Path, label: &str) -> StevedoreResult<()> {
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            StevedoreError::Storage(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(path);
        let meta = fs::symlink_metadata(path).map_err(|e| {
            StevedoreError::Storage(format!("Failed to stat {}: {}", path.display(), e))
        })?;

        hasher.update(label.as_bytes());
        hasher.update(b"/");
        hasher.update(rel.as_os_str().as_encoded_bytes());
        hasher.update([0]);
        hasher.update((meta.permissions().mode() & 0o7777).to_le_bytes());

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| {
                StevedoreError::Storage(format!("Failed to read link {}: {}", path.display(), e))
            })?;
            hasher.update(b"L");
            hasher.update(target.as_os_str().as_encoded_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D");
        } else if file_type.is_file() {
            hasher.update(b"F");
            hasher.update(meta.len().to_le_bytes());
            let mut file = fs::File::open(path).map_err(|e| {
                StevedoreError::Storage(format!("Failed to open {}: {}", path.display(), e))
            })?;
            copy_into(&mut file, hasher).map_err(|e| {
                StevedoreError::Storage(format!("Failed to hash {}: {}", path.display(), e))
            })?;
        } else {
            hasher.update(b"S");
        }
        hasher.update([0]);
    }
    Ok(())
}

/// `sha256:<hex>` of a directory tree.
pub fn tree_digest(root: &Path) -> StevedoreResult<String> {
    let mut hasher = Sha256::new();
    hash_tree(&mut hasher, root, "")?;
    Ok(finish(hasher))
}

fn copy_into<R: Read>(reader: &mut R, hasher: &mut Sha256) -> io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}
