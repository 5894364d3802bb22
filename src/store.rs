//! Blob store — a write-once key→bytes map keyed by SHA-256.
//!
//! # On-disk layout
//!
//! ```text
//! <base>/blobs/<d[0..1]>/<d[0..3]>/<d>
//! ```
//!
//! where `d` is the lowercase hex SHA-256 of the stored bytes.  The
//! two-level sharding bounds directory width.  Writes go to `<path>.part`
//! and are renamed into place, so readers never observe a partial blob and
//! concurrent writers of the same digest converge on the same final file.
//! A blob, once written, is never modified or deleted by this crate.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};

/// Lowercase hex SHA-256 of a byte sequence.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A blob store rooted at a directory.  Blobs live under `<path>/blobs`.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Attach to the blob store under `path`.  No I/O is performed until the
    /// first save or load.
    pub fn attach<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The store's root directory (the parent of `blobs/`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        check_digest(name)?;
        let mut p = self.path.join("blobs");
        p.push(&name[0..1]);
        p.push(&name[0..3]);
        p.push(name);
        Ok(p)
    }

    /// Store a byte sequence and return its digest.
    ///
    /// Idempotent: if a blob with the same digest already exists, nothing is
    /// written and the existing file is left untouched.
    pub fn save(&self, blob: &[u8]) -> Result<String> {
        let name = sha256_hex(blob);
        self.save_named(&name, blob, false)?;
        Ok(name)
    }

    fn save_named(&self, name: &str, blob: &[u8], overwrite: bool) -> Result<()> {
        let target = self.blob_path(name)?;
        if !overwrite && target.is_file() {
            return Ok(());
        }
        self.write_atomic(&target, blob).map_err(Error::Store)
    }

    fn write_atomic(&self, target: &Path, blob: &[u8]) -> io::Result<()> {
        let bucket = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(bucket)?;

        let part = part_path(target);
        let mut f = fs::File::create(&part)?;
        f.write_all(blob)?;
        drop(f);
        fs::rename(&part, target)
    }

    /// Read the complete contents of a blob.
    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: name.to_owned(),
            }),
            Err(e) => Err(Error::Store(e)),
        }
    }

    /// Size in bytes of a stored blob.
    pub fn size(&self, name: &str) -> Result<u64> {
        let path = self.blob_path(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: name.to_owned(),
            }),
            Err(e) => Err(Error::Store(e)),
        }
    }

    /// Whether a blob with this digest is present.
    pub fn contains(&self, name: &str) -> bool {
        self.blob_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Import every blob found under another store directory.
    ///
    /// `src` is the root of the other store (the directory holding `blobs/`).
    /// Each file is re-keyed by the digest of its bytes, so files whose
    /// contents no longer match their name are detected, skipped, and
    /// reported at `warn`.  Returns the number of blobs imported.
    pub fn import_blobs(&self, src: &Path) -> Result<usize> {
        let mut imported = 0;
        let mut work = vec![src.join("blobs")];
        while let Some(dir) = work.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            for entry in entries {
                let entry = entry.map_err(Error::Io)?;
                let path = entry.path();
                if path.is_dir() {
                    work.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".part") {
                    continue;
                }
                let bytes = fs::read(&path)?;
                let digest = sha256_hex(&bytes);
                if digest != name {
                    warn!("skipping {}: contents hash to {}", path.display(), digest);
                    continue;
                }
                if !self.contains(&digest) {
                    self.save(&bytes)?;
                    imported += 1;
                }
            }
        }
        Ok(imported)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

fn check_digest(name: &str) -> Result<()> {
    let ok = name.len() == 64
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(Error::BadDigest(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_is_idempotent_and_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::attach(dir.path());

        let d1 = store.save(b"hello").unwrap();
        let d2 = store.save(b"hello").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(
            d1,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let expected = dir
            .path()
            .join("blobs")
            .join(&d1[0..1])
            .join(&d1[0..3])
            .join(&d1);
        assert!(expected.is_file());
        assert_eq!(store.load(&d1).unwrap(), b"hello");
        assert_eq!(store.size(&d1).unwrap(), 5);
    }

    #[test]
    fn load_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::attach(dir.path());
        let absent = sha256_hex(b"never stored");
        assert!(matches!(
            store.load(&absent),
            Err(Error::BlobNotFound { .. })
        ));
    }

    #[test]
    fn malformed_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::attach(dir.path());
        assert!(matches!(store.load("abc"), Err(Error::BadDigest(_))));
        assert!(matches!(store.load("../etc/passwd"), Err(Error::BadDigest(_))));
    }

    #[test]
    fn import_blobs_skips_corrupt_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let a = FileStore::attach(src.path());
        let b = FileStore::attach(dst.path());

        let d = a.save(b"payload").unwrap();
        // Corrupt a second blob in place.
        let bad = a.save(b"other").unwrap();
        let bad_path = a.blob_path(&bad).unwrap();
        fs::write(&bad_path, b"tampered").unwrap();

        let n = b.import_blobs(src.path()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(b.load(&d).unwrap(), b"payload");
        assert!(!b.contains(&bad));
    }
}
