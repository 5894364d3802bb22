//! Snapshot engine — merge the previous checkin with a fresh scan.
//!
//! A checkin is a timestamped item stream naming the complete state of a
//! workspace.  Taking one never re-reads unchanged file content: the merge
//! carries forward the previous snapshot's chunk references whenever type,
//! size, and mtime all match, so the cost of a checkin is proportional to
//! what changed.
//!
//! Snapshot files live under `.tote/checkin/default/<timestamp>.tote` and
//! are written via `.part` + atomic rename; two overlapping checkins produce
//! two distinct files, neither corrupting the other.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fold::{fold, unfold};
use crate::item::{ts, Item, ItemReader, ItemWriter};
use crate::save::{fill_content, save_file};
use crate::scan::{merge_sorted, scan_tree_relative, Ignore, MergeSorted};
use crate::store::FileStore;

/// Relative directory holding snapshot files.
pub const CHECKIN_DIR: &str = ".tote/checkin/default";

/// The most recent committed snapshot file for a workdir, if any.
///
/// Snapshot names sort chronologically, so the lexicographically greatest
/// `.tote` file with nonzero size wins.  Empty files and `.part` leftovers
/// are passed over.
pub fn most_recent_checkin(workdir: &Path) -> Option<PathBuf> {
    let dir = workdir.join(CHECKIN_DIR);
    let entries = fs::read_dir(&dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names.iter().rev() {
        if !name.ends_with(".tote") {
            continue;
        }
        let path = dir.join(name);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => return Some(path),
            _ => continue,
        }
    }
    None
}

/// Read every item record of a snapshot (or flat archive) file.
pub fn read_items(path: &Path) -> Result<Vec<Item>> {
    let f = fs::File::open(path)?;
    ItemReader::new(std::io::BufReader::new(f)).collect()
}

type ItemStream<'a> = Box<dyn Iterator<Item = Result<Item>> + 'a>;

/// The merged (previous, current) pairs a checkin decides over: the prior
/// snapshot unfolded against a fresh one-filesystem scan of the workspace.
pub fn checkin_pairs<'a>(
    workdir: &'a Path,
    ignore: &'a Ignore,
    store: &'a FileStore,
) -> Result<MergeSorted<ItemStream<'a>, ItemStream<'a>>> {
    let prior = match most_recent_checkin(workdir) {
        Some(path) => read_items(&path)?,
        None => Vec::new(),
    };
    let a: ItemStream<'a> = Box::new(unfold(prior, store)?);
    let b: ItemStream<'a> = Box::new(scan_tree_relative(workdir, Some(ignore), true).map(Ok));
    Ok(merge_sorted(a, b))
}

/// Do two items describe the same file without reading it?  Type, size, and
/// mtime must all agree.
fn same_meta(a: &Item, b: &Item) -> bool {
    a.type_name() == b.type_name() && a.size() == b.size() && a.mtime() == b.mtime()
}

/// One difference between the previous snapshot and the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    New(String),
    Deleted(String),
    Updated(String),
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::New(name) => write!(f, "new {name}"),
            Change::Deleted(name) => write!(f, "del {name}"),
            Change::Updated(name) => write!(f, "update {name}"),
        }
    }
}

/// What a checkin would change, without writing anything.
pub fn checkin_status<'a>(
    workdir: &'a Path,
    ignore: &'a Ignore,
    store: &'a FileStore,
) -> Result<impl Iterator<Item = Result<Change>> + 'a> {
    let pairs = checkin_pairs(workdir, ignore, store)?;
    Ok(pairs.filter_map(|pair| match pair {
        Err(e) => Some(Err(e)),
        Ok((Some(a), None)) => Some(Ok(Change::Deleted(owned_name(&a)))),
        Ok((None, Some(b))) => Some(Ok(Change::New(owned_name(&b)))),
        Ok((Some(a), Some(b))) => {
            if a == b || (matches!(b, Item::File(_)) && same_meta(&a, &b)) {
                None
            } else {
                Some(Ok(Change::Updated(owned_name(&b))))
            }
        }
        Ok((None, None)) => None,
    }))
}

fn owned_name(item: &Item) -> String {
    item.name().unwrap_or_default().to_owned()
}

/// The item stream of a new snapshot: merge decisions applied, changed file
/// content uploaded through the chunk codec.
///
/// Per-file read failures are recorded on the affected item and the stream
/// continues; store failures end the stream with an error.
pub struct Checkin<'a, M> {
    pairs: M,
    workdir: &'a Path,
    store: &'a FileStore,
}

pub fn checkin_save<'a>(
    workdir: &'a Path,
    ignore: &'a Ignore,
    store: &'a FileStore,
) -> Result<Checkin<'a, MergeSorted<ItemStream<'a>, ItemStream<'a>>>> {
    let pairs = checkin_pairs(workdir, ignore, store)?;
    Ok(Checkin {
        pairs,
        workdir,
        store,
    })
}

impl<M> Iterator for Checkin<'_, M>
where
    M: Iterator<Item = Result<(Option<Item>, Option<Item>)>>,
{
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pair = match self.pairs.next()? {
                Ok(pair) => pair,
                Err(e) => return Some(Err(e)),
            };
            match pair {
                (Some(a), None) => {
                    debug!("del {}", owned_name(&a));
                    continue;
                }
                (None, Some(mut b)) => {
                    info!("new {}", owned_name(&b));
                    if let Err(e) = self.save_content(&mut b) {
                        return Some(Err(e));
                    }
                    return Some(Ok(b));
                }
                (Some(a), Some(b)) => {
                    if a == b {
                        return Some(Ok(a));
                    }
                    if matches!(b, Item::File(_)) {
                        if same_meta(&a, &b) {
                            return Some(Ok(a));
                        }
                        info!("update {}", owned_name(&b));
                        let mut b = b;
                        if let Err(e) = self.save_content(&mut b) {
                            return Some(Err(e));
                        }
                        return Some(Ok(b));
                    }
                    info!("update {}", owned_name(&b));
                    return Some(Ok(b));
                }
                (None, None) => continue,
            }
        }
    }
}

impl<M> Checkin<'_, M> {
    fn save_content(&self, item: &mut Item) -> Result<()> {
        let Some(name) = item.name().map(str::to_owned) else {
            return Ok(());
        };
        let path = self.workdir.join(name);
        fill_content(item, &path, self.store)
    }
}

/// Fold a snapshot stream and commit it as a new timestamped checkin file.
/// Returns the path of the committed snapshot.
pub fn write_checkin(
    workdir: &Path,
    store: &FileStore,
    items: impl Iterator<Item = Result<Item>>,
) -> Result<PathBuf> {
    let dir = workdir.join(CHECKIN_DIR);
    fs::create_dir_all(&dir)?;
    let stamp = ts::format(&Utc::now()).replace(':', "-");
    let target = dir.join(format!("{stamp}.tote"));
    let part = dir.join(format!("{stamp}.tote.part"));

    let result = (|| -> Result<()> {
        let f = fs::File::create(&part)?;
        let mut writer = ItemWriter::new(BufWriter::new(f));
        for item in fold(items, store) {
            writer.write(&item?)?;
        }
        writer.flush()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&part);
        return Err(e);
    }

    fs::rename(&part, &target)?;
    Ok(target)
}

// ── Hooks ────────────────────────────────────────────────────────────────────

/// Run `.tote/<name>` in the workdir if it exists and is executable.
///
/// Returns whether a hook ran.  A hook exiting nonzero is an error; the
/// caller decides whether that aborts (pre-hook) or merely warns
/// (post-hook).
pub fn run_hook(workdir: &Path, name: &str) -> Result<bool> {
    let path = workdir.join(".tote").join(name);
    if !is_executable(&path) {
        return Ok(false);
    }
    info!("running hook {}", path.display());
    let status = Command::new(&path).current_dir(workdir).status()?;
    if !status.success() {
        return Err(Error::Hook {
            hook: name.to_owned(),
            status,
        });
    }
    Ok(true)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ── Flat-archive mutation ────────────────────────────────────────────────────

/// Record the prior state of a flat archive in its `.history` sidecar.
///
/// The archive file itself is saved into the store and the resulting file
/// item appended to `<archive>.history`, so every earlier root of the
/// archive stays reachable.
pub fn append_history(archive: &Path, store: &FileStore) -> Result<()> {
    if !archive.exists() {
        return Ok(());
    }
    let item = save_file(archive, store)?;
    let mut name = archive.file_name().unwrap_or_default().to_os_string();
    name.push(".history");
    let history = archive.with_file_name(name);
    let f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(history)?;
    let mut writer = ItemWriter::new(f);
    writer.write(&item)?;
    Ok(())
}

/// Replace a flat archive with a new item stream: history first, then
/// `.part` + atomic rename.
pub fn replace_archive(
    archive: &Path,
    store: &FileStore,
    items: impl Iterator<Item = Result<Item>>,
) -> Result<()> {
    append_history(archive, store)?;

    let mut name = archive.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    let part = archive.with_file_name(name);

    let result = (|| -> Result<()> {
        let f = fs::File::create(&part)?;
        let mut writer = ItemWriter::new(BufWriter::new(f));
        for item in items {
            writer.write(&item?)?;
        }
        writer.flush()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    fs::rename(&part, archive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_skips_empty_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path();
        let checkins = workdir.join(CHECKIN_DIR);
        fs::create_dir_all(&checkins).unwrap();

        fs::write(checkins.join("2024-01-01T00-00-00.000000+00-00.tote"), b"---\n{}\n").unwrap();
        fs::write(checkins.join("2024-06-01T00-00-00.000000+00-00.tote"), b"").unwrap();
        fs::write(checkins.join("2024-07-01T00-00-00.000000+00-00.tote.part"), b"x").unwrap();

        let found = most_recent_checkin(workdir).unwrap();
        assert!(found
            .to_string_lossy()
            .ends_with("2024-01-01T00-00-00.000000+00-00.tote"));
    }

    #[test]
    fn most_recent_without_checkin_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(most_recent_checkin(dir.path()).is_none());
    }
}
