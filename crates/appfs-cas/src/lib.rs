//! # appfs-cas
//!
//! Content-addressed blob store for AppFS.
//!
//! Blobs are identified by their SHA-1 digest and stored with a single-level
//! fan-out: `<cachedir>/sha1/<hh>/<remaining-38-hex>`, where `hh` is the first
//! two hex digits of the digest and the filename is the remaining 38.
//!
//! Insertion is atomic: bytes are streamed into a temp file in the same
//! directory as the final location, hashed as they are written, and only
//! renamed into place if the digest matches what the caller expected.
//! Concurrent inserts of the same hash are harmless — the last rename wins,
//! and readers always see either a complete file or no file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::instrument;

/// A SHA-1 digest, as raw bytes.
pub type Sha1Hash = [u8; 20];

#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {hash}")]
    NotFound { hash: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Compute the SHA-1 digest of a byte slice.
pub fn compute_hash(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render a digest as a lowercase 40-character hex string.
pub fn hash_to_hex(hash: &Sha1Hash) -> String {
    hex::encode(hash)
}

/// Parse a 40-character hex string into a digest.
pub fn hex_to_hash(hex_str: &str) -> Option<Sha1Hash> {
    if hex_str.len() != 40 {
        return None;
    }
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// A disk-backed, immutable, content-addressed blob store.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Open (creating if necessary) a blob store rooted at `<cachedir>/sha1`.
    pub fn new<P: AsRef<Path>>(cachedir: P) -> Result<Self> {
        let root = cachedir.as_ref().join("sha1");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path a blob with the given hash would occupy, whether or not it exists.
    pub fn path_for(&self, hash: &Sha1Hash) -> PathBuf {
        let hex_str = hash_to_hex(hash);
        self.root.join(&hex_str[..2]).join(&hex_str[2..])
    }

    /// Whether a blob with the given hash is present.
    pub fn has(&self, hash: &Sha1Hash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Stream `data` into the store, verifying it hashes to `expected` before
    /// the rename that makes it visible. On mismatch the temp file is removed
    /// and nothing under the final path is touched.
    #[instrument(skip(self, data), level = "debug")]
    pub fn insert_atomic<R: Read>(&self, mut data: R, expected: &Sha1Hash) -> Result<()> {
        let final_path = self.path_for(expected);

        if final_path.exists() {
            // Drain the reader so callers that own a streaming body don't
            // leave it half-consumed, but skip re-verifying: dedup is a no-op.
            io::copy(&mut data, &mut io::sink())?;
            return Ok(());
        }

        let parent = final_path.parent().expect("path_for always has a parent");
        fs::create_dir_all(parent)?;

        let tmp_name = format!(
            ".{}.{}.tmp",
            final_path.file_name().unwrap().to_string_lossy(),
            std::process::id()
        );
        let tmp_path = parent.join(tmp_name);

        let mut hasher = Sha1::new();
        {
            let mut tmp_file = File::create(&tmp_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = data.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp_file.write_all(&buf[..n])?;
            }
            tmp_file.sync_all()?;
        }

        let actual: Sha1Hash = hasher.finalize().into();
        if actual != *expected {
            let _ = fs::remove_file(&tmp_path);
            return Err(CasError::HashMismatch {
                expected: hash_to_hex(expected),
                actual: hash_to_hex(&actual),
            });
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            if final_path.exists() {
                // Another writer beat us to it with the same content.
                return Ok(());
            }
            return Err(CasError::Io(e));
        }

        Ok(())
    }

    /// Insert pre-hashed in-memory bytes (convenience wrapper for tests and
    /// small blobs such as index/manifest documents).
    pub fn insert_bytes(&self, data: &[u8]) -> Result<Sha1Hash> {
        let hash = compute_hash(data);
        self.insert_atomic(data, &hash)?;
        Ok(hash)
    }

    /// Read a blob's full contents, verifying its digest on the way out.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let path = self.path_for(hash);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CasError::NotFound {
                    hash: hash_to_hex(hash),
                }
            } else {
                CasError::Io(e)
            }
        })?;

        let actual = compute_hash(&data);
        if actual != *hash {
            return Err(CasError::HashMismatch {
                expected: hash_to_hex(hash),
                actual: hash_to_hex(&actual),
            });
        }

        Ok(data)
    }

    /// Root directory of the store (`<cachedir>/sha1`).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_and_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();

        let data = b"hello appfs";
        let hash = cas.insert_bytes(data).unwrap();

        assert!(cas.has(&hash));
        assert_eq!(cas.get(&hash).unwrap(), data);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let dir = TempDir::new().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();

        let data = b"duplicate content";
        let hash1 = cas.insert_bytes(data).unwrap();
        let hash2 = cas.insert_bytes(data).unwrap();

        assert_eq!(hash1, hash2);
    }

    #[test]
    fn mismatched_hash_is_rejected_and_not_stored() {
        let dir = TempDir::new().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();

        let wrong_hash = compute_hash(b"something else entirely");
        let err = cas.insert_atomic(&b"actual bytes"[..], &wrong_hash).unwrap_err();
        assert!(matches!(err, CasError::HashMismatch { .. }));
        assert!(!cas.has(&wrong_hash));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();

        let hash = compute_hash(b"never stored");
        let err = cas.get(&hash).unwrap_err();
        assert!(matches!(err, CasError::NotFound { .. }));
    }

    #[test]
    fn path_layout_matches_spec() {
        let dir = TempDir::new().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();

        let hash = compute_hash(b"layout check");
        let hex_str = hash_to_hex(&hash);
        let path = cas.path_for(&hash);

        assert_eq!(path, dir.path().join("sha1").join(&hex_str[..2]).join(&hex_str[2..]));
    }

    #[test]
    fn hex_roundtrip() {
        let hash = compute_hash(b"roundtrip");
        let hex_str = hash_to_hex(&hash);
        assert_eq!(hex_to_hash(&hex_str).unwrap(), hash);
    }
}
