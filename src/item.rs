//! Item records and the `---`-framed JSON text stream.
//!
//! An item stream is UTF-8 text: each record is the line `---` followed by
//! the item's JSON object.  The five named variants share a `name` and
//! differ by `type`; records with a missing or unrecognized `type` are
//! carried through verbatim as opaque [`Item::Stream`] maps so that foreign
//! fields and future record kinds survive a round-trip.

use std::io::{BufRead, Write};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::Chunk;
use crate::error::{Error, Result};

/// Line separating records in an item stream.
pub const STREAM_SEPARATOR: &str = "---";

// ── Canonical name ordering ──────────────────────────────────────────────────

/// Sort key of an archive name: its POSIX path parts.
///
/// Comparing keys compares part tuples, so `a/x` sorts between the sibling
/// directories `a` and `a.b` — the order a sorted depth-first walk yields.
pub type PathKey = Vec<String>;

/// Split an archive name into its canonical sort key.  Leading slashes and
/// `.`/`..` components are dropped, so only clean relative parts remain.
pub fn path_key(name: &str) -> PathKey {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(str::to_owned)
        .collect()
}

// ── Timestamps ───────────────────────────────────────────────────────────────

/// Timestamp codec: written as `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`, read in
/// that form plus the legacy `...Z` and second-precision variants.
pub mod ts {
    use super::*;

    pub fn format(t: &DateTime<Utc>) -> String {
        t.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|n| n.and_utc())
            .map_err(|_| Error::Timestamp(s.to_owned()))
    }

    /// Truncate to microsecond precision, the resolution of the text form.
    /// Mtimes are truncated at capture time so that format → parse → compare
    /// is exact and unchanged files are never spuriously re-saved.
    pub fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
        t.with_nanosecond(t.nanosecond() / 1000 * 1000).unwrap_or(t)
    }
}

/// Serde adapter for optional timestamp fields.
mod ts_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        t: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match t {
            Some(t) => serializer.serialize_str(&ts::format(t)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => ts::parse(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// ── Item variants ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_opt")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Chunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_opt")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_opt")]
    pub mtime: Option<DateTime<Utc>>,
    /// The symlink target, as recorded on disk.
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Shape of `missing` and `other` records: a name and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl NamedItem {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            error: None,
            extra: Map::new(),
        }
    }
}

/// A packed page of items: one chunk holding their serialized stream plus
/// the bounding names under the canonical ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldItem {
    pub content: Vec<Chunk>,
    pub count: u64,
    pub name_min: String,
    pub name_max: String,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Item {
    File(FileItem),
    Dir(DirItem),
    Link(LinkItem),
    Missing(NamedItem),
    Other(NamedItem),
    Fold(FoldItem),
    /// Record with a missing or unrecognized `type`, passed through verbatim.
    #[serde(untagged)]
    Stream(Map<String, Value>),
}

impl Item {
    pub fn name(&self) -> Option<&str> {
        match self {
            Item::File(i) => Some(&i.name),
            Item::Dir(i) => Some(&i.name),
            Item::Link(i) => Some(&i.name),
            Item::Missing(i) | Item::Other(i) => Some(&i.name),
            Item::Fold(_) => None,
            Item::Stream(map) => map.get("name").and_then(Value::as_str),
        }
    }

    /// The name this item sorts by: `name`, or `name_min` for a fold.
    pub fn sort_name(&self) -> Option<&str> {
        match self {
            Item::Fold(f) => Some(&f.name_min),
            Item::Stream(map) => map
                .get("name")
                .or_else(|| map.get("name_min"))
                .and_then(Value::as_str),
            other => other.name(),
        }
    }

    /// Canonical sort key; an item with no name cannot be ordered.
    pub fn key(&self) -> Result<PathKey> {
        self.sort_name().map(path_key).ok_or(Error::Unnamed)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Item::File(_) => "file",
            Item::Dir(_) => "dir",
            Item::Link(_) => "link",
            Item::Missing(_) => "missing",
            Item::Other(_) => "other",
            Item::Fold(_) => "fold",
            Item::Stream(_) => "stream",
        }
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        match self {
            Item::File(i) => i.mtime,
            Item::Dir(i) => i.mtime,
            Item::Link(i) => i.mtime,
            _ => None,
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Item::File(i) => i.size,
            _ => None,
        }
    }

    /// Record an I/O failure observed while saving this item.
    pub fn set_error(&mut self, message: String) {
        match self {
            Item::File(i) => i.error = Some(message),
            Item::Dir(i) => i.error = Some(message),
            Item::Link(i) => i.error = Some(message),
            Item::Missing(i) | Item::Other(i) => i.error = Some(message),
            Item::Fold(_) | Item::Stream(_) => {}
        }
    }

    /// The chunk list behind this item's content, if any.  Opaque stream
    /// records may carry a `content` field too; it is decoded on demand.
    pub fn content(&self) -> Result<Vec<Chunk>> {
        match self {
            Item::File(i) => Ok(i.content.clone().unwrap_or_default()),
            Item::Fold(f) => Ok(f.content.clone()),
            Item::Stream(map) => match map.get("content") {
                Some(value) => Ok(serde_json::from_value(value.clone())?),
                None => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }
}

// ── Text stream codec ────────────────────────────────────────────────────────

/// Render one item as a stream record: `---`, the JSON object, a newline.
pub fn to_stream(item: &Item) -> Result<String> {
    Ok(format!(
        "{}\n{}\n",
        STREAM_SEPARATOR,
        serde_json::to_string_pretty(item)?
    ))
}

/// Parse a complete item stream held in memory.
pub fn from_stream(text: &str) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut group = String::new();
    for line in text.lines() {
        if line == STREAM_SEPARATOR {
            flush_group(&mut group, &mut items)?;
        } else {
            group.push_str(line);
            group.push('\n');
        }
    }
    flush_group(&mut group, &mut items)?;
    Ok(items)
}

fn flush_group(group: &mut String, items: &mut Vec<Item>) -> Result<()> {
    if !group.trim().is_empty() {
        items.push(serde_json::from_str(group)?);
    }
    group.clear();
    Ok(())
}

/// Lazily parse an item stream from a reader, one record at a time.
pub struct ItemReader<R> {
    reader: R,
}

impl<R: BufRead> ItemReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> Iterator for ItemReader<R> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut group = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Err(e) => return Some(Err(e.into())),
                Ok(0) => {
                    if group.trim().is_empty() {
                        return None;
                    }
                    return Some(serde_json::from_str(&group).map_err(Error::from));
                }
                Ok(_) => {
                    let text = line.trim_end_matches(['\r', '\n']);
                    if text == STREAM_SEPARATOR {
                        if group.trim().is_empty() {
                            continue;
                        }
                        return Some(serde_json::from_str(&group).map_err(Error::from));
                    }
                    group.push_str(text);
                    group.push('\n');
                }
            }
        }
    }
}

/// Write items as a stream.
pub struct ItemWriter<W: Write> {
    writer: W,
}

impl<W: Write> ItemWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write(&mut self, item: &Item) -> Result<()> {
        self.writer.write_all(to_stream(item)?.as_bytes())?;
        Ok(())
    }

    pub fn write_all<'a, I: IntoIterator<Item = &'a Item>>(&mut self, items: I) -> Result<()> {
        for item in items {
            self.write(item)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
