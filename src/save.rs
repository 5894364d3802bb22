//! Save files and byte streams into the store; restore them back out.
//!
//! A byte source is read in fixed 16 MiB slices, each slice becoming one
//! chunk.  The file item records the chunk list, the total length, and the
//! SHA-256 of the whole plaintext, so content integrity can be verified
//! end-to-end independently of the per-chunk digests.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::chunk::{load_chunk, save_chunk, Chunk};
use crate::error::{Error, Result};
use crate::item::{path_key, ts, DirItem, FileItem, Item, LinkItem, NamedItem};
use crate::store::FileStore;

/// Slice size for streaming saves: 2^24 bytes.
pub const CHUNK_SIZE: usize = 1 << 24;

/// The fields `save_stream` contributes to a file item.
#[derive(Debug, Clone, Serialize)]
pub struct SavedContent {
    pub content: Vec<Chunk>,
    pub sha256: String,
    pub size: u64,
}

/// Stream a byte source into the store, one chunk per 16 MiB slice.
///
/// An empty source produces an empty chunk list, size 0, and the digest of
/// the empty string.
pub fn save_stream<R: Read>(mut source: R, store: &FileStore) -> Result<SavedContent> {
    let mut content = Vec::new();
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut source, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
        content.push(save_chunk(&buf[..n], store)?);
        if n < CHUNK_SIZE {
            break;
        }
    }
    Ok(SavedContent {
        content,
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

/// Fill `buf` from `r`, tolerating short reads.  Returns bytes read; fewer
/// than `buf.len()` means EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A path's modification time in UTC, truncated to the precision that
/// survives serialization.
pub(crate) fn mtime_utc(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(|t| ts::truncate(t.into()))
}

/// Build the metadata-only item for a path, the shape the tree scanner
/// emits: no content is read.
pub fn stat_item(path: &Path, name: &str) -> Item {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Item::Missing(NamedItem::new(name));
        }
        Err(e) => {
            let mut item = Item::Other(NamedItem::new(name));
            item.set_error(e.to_string());
            return item;
        }
    };
    let mtime = mtime_utc(&meta);
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let (target, error) = match fs::read_link(path) {
            Ok(t) => (t.to_string_lossy().into_owned(), None),
            Err(e) => (String::new(), Some(e.to_string())),
        };
        return Item::Link(LinkItem {
            name: name.to_owned(),
            mtime,
            target,
            error,
            extra: Default::default(),
        });
    }
    if file_type.is_dir() {
        return Item::Dir(DirItem {
            name: name.to_owned(),
            mtime,
            error: None,
            extra: Default::default(),
        });
    }
    if file_type.is_file() {
        return Item::File(FileItem {
            name: name.to_owned(),
            mtime,
            size: Some(meta.len()),
            content: None,
            sha256: None,
            error: None,
            extra: Default::default(),
        });
    }
    Item::Other(NamedItem::new(name))
}

/// Save one path: stat it, and for a regular file stream its contents
/// through the chunk codec.
pub fn save_file(path: &Path, store: &FileStore) -> Result<Item> {
    let name = posix_name(path);
    let mut item = stat_item(path, &name);
    fill_content(&mut item, path, store)?;
    Ok(item)
}

/// Read a file item's bytes from disk through the chunk codec, attaching
/// `content`, `sha256`, and `size`.
///
/// Per-file read failures are recorded in the item's `error` field and do
/// not abort; store failures propagate.
pub fn fill_content(item: &mut Item, path: &Path, store: &FileStore) -> Result<()> {
    let Item::File(file) = item else {
        return Ok(());
    };
    let saved = fs::File::open(path)
        .map_err(Error::from)
        .and_then(|f| save_stream(f, store));
    match saved {
        Ok(saved) => {
            file.size = Some(saved.size);
            file.sha256 = Some(saved.sha256);
            file.content = Some(saved.content);
        }
        Err(Error::Store(e)) => return Err(Error::Store(e)),
        Err(e) => file.error = Some(e.to_string()),
    }
    Ok(())
}

/// Lazily decode an item's chunks in order.  Concatenating the yielded
/// slices reproduces the original byte stream.
pub fn load_content<'a>(
    item: &Item,
    store: &'a FileStore,
) -> Result<impl Iterator<Item = Result<Vec<u8>>> + 'a> {
    let chunks = item.content()?;
    Ok(chunks.into_iter().map(move |part| load_chunk(&part, store)))
}

/// Materialize one item beneath `base`.
///
/// Directories are created recursively (idempotent), file bodies are written
/// via `.part` + rename, links are re-created.  Fold items are rejected;
/// unfold the stream first.  Names are reduced to their clean relative
/// parts, so a crafted name can never escape `base`.
pub fn extract_file(item: &Item, store: &FileStore, base: &Path) -> Result<()> {
    let Some(name) = item.name() else {
        return match item {
            Item::Fold(_) => Err(Error::Folded),
            _ => Ok(()),
        };
    };
    let rel: PathBuf = path_key(name).iter().collect();
    let dest = base.join(rel);

    match item {
        Item::Dir(_) => {
            fs::create_dir_all(&dest)?;
        }
        Item::File(_) => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let part = part_path(&dest);
            let result = write_content(item, store, &part);
            if result.is_err() {
                let _ = fs::remove_file(&part);
                return result;
            }
            fs::rename(&part, &dest)?;
        }
        Item::Link(link) => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            make_symlink(&link.target, &dest)?;
        }
        Item::Fold(_) => return Err(Error::Folded),
        Item::Missing(_) | Item::Other(_) | Item::Stream(_) => {}
    }
    Ok(())
}

fn write_content(item: &Item, store: &FileStore, path: &Path) -> Result<()> {
    let mut f = fs::File::create(path)?;
    for slice in load_content(item, store)? {
        f.write_all(&slice?)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, dest: &Path) -> Result<()> {
    Err(Error::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create symlink {}", dest.display()),
    )))
}

/// A path as an archive name: forward slashes only.
pub(crate) fn posix_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        name.into_owned()
    } else {
        name.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}
