// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed blob store for uploaded documents and OCR artifacts.
//!
//! Blobs are immutable files named by the hex SHA-256 of their bytes, laid
//! out in a two-level fan-out under the store root. A sidecar `.meta.json`
//! records the media type and receipt time. Reads re-hash the bytes and
//! fail with [`BlobError::Corrupt`] on mismatch. The store touches the
//! local filesystem only.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use knj_core::{sha256_hex, BlobId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    NotFound(BlobId),

    /// Stored bytes no longer hash to the blob id.
    #[error("blob corrupt: {id} (stored bytes hash to {actual})")]
    Corrupt {
        /// Requested blob id.
        id: BlobId,
        /// Hash of the bytes actually on disk.
        actual: String,
    },

    /// Filesystem failure.
    #[error("blob io: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata sidecar failed to parse.
    #[error("blob metadata unreadable: {0}")]
    BadMetadata(BlobId),
}

/// Sidecar metadata stored next to each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Declared media type of the upload.
    pub media_type: String,
    /// When the blob was first stored.
    pub received_at: DateTime<Utc>,
}

/// Retention policy for [`BlobStore::gc`].
#[derive(Debug, Clone)]
pub struct GcPolicy {
    /// Minimum age before a blob is eligible for collection.
    pub min_age_days: i64,
    /// Blob ids that must be kept regardless of age (still referenced).
    pub referenced: HashSet<BlobId>,
}

/// Outcome of a garbage-collection sweep.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Number of blobs removed.
    pub removed: usize,
    /// Number of blobs kept because they are referenced.
    pub kept_referenced: usize,
    /// Number of blobs kept because they are too young.
    pub kept_young: usize,
}

/// Filesystem-backed content-addressed store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store bytes and return their content address.
    ///
    /// Re-putting identical bytes is a no-op returning the same id, so
    /// concurrent uploads of the same document converge.
    pub fn put(&self, bytes: &[u8], media_type: &str) -> Result<BlobId, BlobError> {
        let id = BlobId(sha256_hex(bytes));
        let path = self.blob_path(&id);
        if path.exists() {
            debug!(blob = %id, "put: already present");
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crashed put never leaves a partial blob
        // under its final name.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        let meta = BlobMeta {
            media_type: media_type.to_string(),
            received_at: Utc::now(),
        };
        fs::write(
            self.meta_path(&id),
            serde_json::to_vec_pretty(&meta).expect("meta serializes"),
        )?;
        debug!(blob = %id, media_type, "put: stored");
        Ok(id)
    }

    /// Fetch a blob's bytes and media type, verifying integrity.
    pub fn get(&self, id: &BlobId) -> Result<(Vec<u8>, String), BlobError> {
        let path = self.blob_path(id);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BlobError::NotFound(id.clone()),
            _ => BlobError::Io(e),
        })?;
        let actual = sha256_hex(&bytes);
        if actual != id.0 {
            return Err(BlobError::Corrupt {
                id: id.clone(),
                actual,
            });
        }
        let meta = self.meta(id)?;
        Ok((bytes, meta.media_type))
    }

    /// Read a blob's sidecar metadata.
    pub fn meta(&self, id: &BlobId) -> Result<BlobMeta, BlobError> {
        let raw = fs::read(self.meta_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BlobError::NotFound(id.clone()),
            _ => BlobError::Io(e),
        })?;
        serde_json::from_slice(&raw).map_err(|_| BlobError::BadMetadata(id.clone()))
    }

    /// Returns `true` if the blob exists.
    #[must_use]
    pub fn contains(&self, id: &BlobId) -> bool {
        self.blob_path(id).exists()
    }

    /// Sweep unreferenced blobs older than the policy's minimum age.
    ///
    /// Deletion only ever happens here; nothing else in the system removes
    /// a stored document.
    pub fn gc(&self, policy: &GcPolicy) -> Result<GcReport, BlobError> {
        let mut report = GcReport::default();
        let cutoff = Utc::now() - chrono::Duration::days(policy.min_age_days);

        for id in self.list()? {
            if policy.referenced.contains(&id) {
                report.kept_referenced += 1;
                continue;
            }
            let meta = match self.meta(&id) {
                Ok(m) => m,
                Err(err) => {
                    warn!(blob = %id, error = %err, "gc: unreadable metadata, keeping");
                    report.kept_young += 1;
                    continue;
                }
            };
            if meta.received_at > cutoff {
                report.kept_young += 1;
                continue;
            }
            fs::remove_file(self.blob_path(&id))?;
            let _ = fs::remove_file(self.meta_path(&id));
            report.removed += 1;
        }
        Ok(report)
    }

    /// Enumerate all stored blob ids.
    pub fn list(&self) -> Result<Vec<BlobId>, BlobError> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                    out.push(BlobId(name));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.root.join(&id.0[..2]).join(&id.0)
    }

    fn meta_path(&self, id: &BlobId) -> PathBuf {
        self.root
            .join(&id.0[..2])
            .join(format!("{}.meta.json", id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let id = store.put(b"<Invoice/>", "application/xml").unwrap();
        let (bytes, media) = store.get(&id).unwrap();
        assert_eq!(bytes, b"<Invoice/>");
        assert_eq!(media, "application/xml");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same bytes", "text/plain").unwrap();
        let b = store.put(b"same bytes", "text/plain").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        let id = BlobId("0".repeat(64));
        assert!(matches!(store.get(&id), Err(BlobError::NotFound(_))));
    }

    #[test]
    fn tampered_bytes_are_corrupt() {
        let (_dir, store) = store();
        let id = store.put(b"original", "text/plain").unwrap();
        let path = store.blob_path(&id);
        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(store.get(&id), Err(BlobError::Corrupt { .. })));
    }

    #[test]
    fn gc_honours_references_and_age() {
        let (_dir, store) = store();
        let kept = store.put(b"referenced", "text/plain").unwrap();
        let fresh = store.put(b"fresh", "text/plain").unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(kept.clone());
        let report = store
            .gc(&GcPolicy {
                min_age_days: 0,
                referenced,
            })
            .unwrap();

        // `fresh` was just written with min_age 0 days, so the cutoff is
        // "now": it is removed; the referenced blob survives.
        assert_eq!(report.kept_referenced, 1);
        assert_eq!(report.removed, 1);
        assert!(store.contains(&kept));
        assert!(!store.contains(&fresh));
    }
}
