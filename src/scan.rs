//! Tree walker and `.toteignore` engine.
//!
//! The walker yields paths in canonical name order — the order of POSIX
//! path-part tuples, which is the order a sorted depth-first walk produces.
//! Every downstream stage (merge, fold, checkin) assumes this ordering.
//!
//! # Ignore rules
//!
//! Each directory may carry a `.toteignore` file, read once per traversal
//! and cached.  One rule per line:
//!
//! - blank lines and `#` comments are skipped
//! - a leading `!` inverts the rule (a match means "do not ignore")
//! - a leading `/` anchors the rule at the directory owning the file
//! - patterns are split on `/`; each part is a glob (`*`, `?`, `[...]`)
//! - an unanchored pattern matches the trailing parts of a candidate path
//!
//! A path is checked against its ancestors from the nearest directory
//! outward to the traversal base; the first rule giving a definite answer
//! wins.  The literal name `.tote` at the base is always ignored.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::item::{Item, PathKey};
use crate::save::stat_item;

// ── Glob matching ────────────────────────────────────────────────────────────

/// Match one glob pattern part against one path part.
fn match_part(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    match_chars(&pat, &txt)
}

fn match_chars(pat: &[char], txt: &[char]) -> bool {
    match pat.first() {
        None => txt.is_empty(),
        Some('*') => (0..=txt.len()).any(|i| match_chars(&pat[1..], &txt[i..])),
        Some('?') => !txt.is_empty() && match_chars(&pat[1..], &txt[1..]),
        Some('[') => match parse_class(pat) {
            Some((negated, class, rest)) => match txt.first() {
                Some(&c) => class_matches(class, c) != negated && match_chars(rest, &txt[1..]),
                None => false,
            },
            // Unterminated class: treat '[' as a literal.
            None => txt.first() == Some(&'[') && match_chars(&pat[1..], &txt[1..]),
        },
        Some(&c) => txt.first() == Some(&c) && match_chars(&pat[1..], &txt[1..]),
    }
}

/// Split `[...]`/`[!...]` off the front of a pattern.  Returns the negation
/// flag, the class body, and the rest of the pattern.
fn parse_class(pat: &[char]) -> Option<(bool, &[char], &[char])> {
    let (negated, body_start) = if pat.get(1) == Some(&'!') {
        (true, 2)
    } else {
        (false, 1)
    };
    // The first position may hold a literal ']'.
    let mut end = body_start + 1;
    while end < pat.len() && pat[end] != ']' {
        end += 1;
    }
    if end >= pat.len() || end == body_start {
        return None;
    }
    Some((negated, &pat[body_start..end], &pat[end + 1..]))
}

fn class_matches(class: &[char], c: char) -> bool {
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                return true;
            }
            i += 3;
        } else {
            if class[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

// ── Rules ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Rule {
    invert: bool,
    anchored: bool,
    parts: Vec<String>,
}

impl Rule {
    fn parse(line: &str) -> Option<Rule> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (invert, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (anchored, line) = match line.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let line = line.trim_end_matches('/');
        // A rule cannot ignore the directory holding it.
        if line.is_empty() || line == "." {
            return None;
        }
        Some(Rule {
            invert,
            anchored,
            parts: line.split('/').map(str::to_owned).collect(),
        })
    }

    /// A definite answer for a candidate path (as parts relative to the
    /// directory owning this rule), or `None` when the rule does not apply.
    fn check(&self, candidate: &[String]) -> Option<bool> {
        if self.parts.len() > candidate.len() {
            return None;
        }
        if self.anchored && self.parts.len() != candidate.len() {
            return None;
        }
        let tail = &candidate[candidate.len() - self.parts.len()..];
        let hit = self
            .parts
            .iter()
            .zip(tail)
            .all(|(pat, part)| match_part(pat, part));
        if hit {
            Some(!self.invert)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Rules(Vec<Rule>);

impl Rules {
    fn check(&self, candidate: &[String]) -> Option<bool> {
        self.0.iter().find_map(|rule| rule.check(candidate))
    }
}

/// The name of the per-directory rule file.
pub const IGNORE_FILE: &str = ".toteignore";

fn load_rules(dir: &Path) -> Rules {
    let path = dir.join(IGNORE_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Rules::default(),
        Err(e) => {
            warn!("cannot read {}: {}", path.display(), e);
            return Rules::default();
        }
    };
    Rules(text.lines().filter_map(Rule::parse).collect())
}

// ── Ignore engine ────────────────────────────────────────────────────────────

/// Cascading ignore-rule evaluation for one traversal, with rule files
/// cached per directory.  The cache is scoped to this value; a new traversal
/// starts fresh and sees rule-file edits.
pub struct Ignore {
    base: PathBuf,
    cache: RefCell<HashMap<PathBuf, Rules>>,
}

impl Ignore {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self {
            base: base.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Should `path` be left out of the traversal?
    pub fn check(&self, path: &Path) -> bool {
        // The base itself is never ignored, and no rules above it apply.
        if path == self.base {
            return false;
        }
        let Some(name) = file_name(path) else {
            return false;
        };
        let mut dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return false,
        };
        let mut rel = vec![name];
        loop {
            if dir == self.base && rel.len() == 1 && rel[0] == ".tote" {
                return true;
            }
            if let Some(answer) = self.check_dir(&dir, &rel) {
                return answer;
            }
            if dir == self.base {
                return false;
            }
            let Some(name) = file_name(&dir) else {
                return false;
            };
            let Some(parent) = dir.parent().map(Path::to_path_buf) else {
                return false;
            };
            rel.insert(0, name);
            dir = parent;
        }
    }

    fn check_dir(&self, dir: &Path, rel: &[String]) -> Option<bool> {
        let mut cache = self.cache.borrow_mut();
        let rules = cache
            .entry(dir.to_path_buf())
            .or_insert_with(|| load_rules(dir));
        rules.check(rel)
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

// ── Walker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkOptions {
    /// Descend into directories.  When false, only the given roots are
    /// yielded.
    pub recursive: bool,
    /// Do not descend into directories on a different filesystem than the
    /// root they were reached from.
    pub one_filesystem: bool,
}

struct QueueEntry {
    key: PathKey,
    path: PathBuf,
    root_dev: Option<u64>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.path == other.path
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.path.cmp(&other.path))
    }
}

/// Enumerate filesystem paths in canonical name order.
///
/// A min-priority queue keyed by path parts drives the walk; duplicate keys
/// are collapsed so no path is yielded twice.  Symlinked directories are
/// never descended.  Unreadable directories are reported at `warn` and the
/// traversal continues.
pub struct TreeScan<'a> {
    queue: BinaryHeap<Reverse<QueueEntry>>,
    last: Option<PathKey>,
    ignore: Option<&'a Ignore>,
    opts: WalkOptions,
}

pub fn treescan<'a, I>(roots: I, ignore: Option<&'a Ignore>, opts: WalkOptions) -> TreeScan<'a>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut queue = BinaryHeap::new();
    for path in roots {
        let root_dev = fs::symlink_metadata(&path).ok().as_ref().and_then(dev_of);
        queue.push(Reverse(QueueEntry {
            key: path_parts(&path),
            path,
            root_dev,
        }));
    }
    TreeScan {
        queue,
        last: None,
        ignore,
        opts,
    }
}

impl Iterator for TreeScan<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse(entry) = self.queue.pop()?;
            if self.last.as_ref() == Some(&entry.key) {
                continue;
            }
            if let Some(ignore) = self.ignore {
                if ignore.check(&entry.path) {
                    continue;
                }
            }
            if self.opts.recursive {
                self.descend(&entry);
            }
            self.last = Some(entry.key);
            return Some(entry.path);
        }
    }
}

impl TreeScan<'_> {
    fn descend(&mut self, entry: &QueueEntry) {
        let Ok(meta) = fs::symlink_metadata(&entry.path) else {
            return;
        };
        if !meta.file_type().is_dir() || meta.file_type().is_symlink() {
            return;
        }
        if self.opts.one_filesystem {
            match (dev_of(&meta), entry.root_dev) {
                (Some(dev), Some(root_dev)) if dev != root_dev => return,
                _ => {}
            }
        }
        let entries = match fs::read_dir(&entry.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read directory {}: {}", entry.path.display(), e);
                return;
            }
        };
        for child in entries {
            match child {
                Ok(child) => {
                    let path = child.path();
                    self.queue.push(Reverse(QueueEntry {
                        key: path_parts(&path),
                        path,
                        root_dev: entry.root_dev,
                    }));
                }
                Err(e) => warn!("while listing {}: {}", entry.path.display(), e),
            }
        }
    }
}

/// A path's canonical sort key: its normal components.
fn path_parts(path: &Path) -> PathKey {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

#[cfg(unix)]
fn dev_of(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.dev())
}

#[cfg(not(unix))]
fn dev_of(_meta: &fs::Metadata) -> Option<u64> {
    None
}

// ── Relative scanner ─────────────────────────────────────────────────────────

/// Scan the tree beneath `base`, yielding metadata-only items whose names
/// are relative to `base`, in canonical order.  The base directory itself is
/// not yielded.  Content is never read; file items carry size and mtime
/// only.
pub struct ScanTree<'a> {
    base: PathBuf,
    ignore: Option<&'a Ignore>,
    one_filesystem: bool,
    base_dev: Option<u64>,
    // Depth-first: children are pushed in reverse-sorted order so the next
    // name in canonical order is always on top.
    stack: Vec<String>,
}

pub fn scan_tree_relative<'a, P: Into<PathBuf>>(
    base: P,
    ignore: Option<&'a Ignore>,
    one_filesystem: bool,
) -> ScanTree<'a> {
    let base = base.into();
    let base_dev = fs::symlink_metadata(&base).ok().as_ref().and_then(dev_of);
    let mut scan = ScanTree {
        base,
        ignore,
        one_filesystem,
        base_dev,
        stack: Vec::new(),
    };
    let children = scan.list_children("");
    scan.stack = children;
    scan
}

impl ScanTree<'_> {
    /// Children of a relative directory name, reverse-sorted for the stack.
    fn list_children(&self, name: &str) -> Vec<String> {
        let dir = if name.is_empty() {
            self.base.clone()
        } else {
            self.base.join(name)
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.file_name().to_string_lossy().into_owned()),
                Err(e) => {
                    warn!("while listing {}: {}", dir.display(), e);
                    None
                }
            })
            .map(|child| {
                if name.is_empty() {
                    child
                } else {
                    format!("{name}/{child}")
                }
            })
            .collect();
        names.sort_by(|a, b| b.cmp(a));
        names
    }

    fn should_descend(&self, path: &Path, item: &Item) -> bool {
        if !matches!(item, Item::Dir(_)) {
            return false;
        }
        if self.one_filesystem {
            let dev = fs::symlink_metadata(path).ok().as_ref().and_then(dev_of);
            if dev.is_some() && dev != self.base_dev {
                return false;
            }
        }
        true
    }
}

impl Iterator for ScanTree<'_> {
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let name = self.stack.pop()?;
            let path = self.base.join(&name);
            if let Some(ignore) = self.ignore {
                if ignore.check(&path) {
                    continue;
                }
            }
            let item = stat_item(&path, &name);
            if self.should_descend(&path, &item) {
                let mut children = self.list_children(&name);
                self.stack.append(&mut children);
            }
            return Some(item);
        }
    }
}

// ── Merge ────────────────────────────────────────────────────────────────────

/// Pair two item streams sorted by canonical name.
///
/// Yields `(Some, None)` for names only in `a`, `(None, Some)` for names
/// only in `b`, and `(Some, Some)` for names in both.  Errors from either
/// side pass through.
pub struct MergeSorted<A, B> {
    a: A,
    b: B,
    slot_a: Option<(PathKey, Item)>,
    slot_b: Option<(PathKey, Item)>,
    started: bool,
}

pub fn merge_sorted<A, B>(a: A, b: B) -> MergeSorted<A, B>
where
    A: Iterator<Item = crate::error::Result<Item>>,
    B: Iterator<Item = crate::error::Result<Item>>,
{
    MergeSorted {
        a,
        b,
        slot_a: None,
        slot_b: None,
        started: false,
    }
}

type Pair = (Option<Item>, Option<Item>);

impl<A, B> Iterator for MergeSorted<A, B>
where
    A: Iterator<Item = crate::error::Result<Item>>,
    B: Iterator<Item = crate::error::Result<Item>>,
{
    type Item = crate::error::Result<Pair>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if let Err(e) = self.pull_a() {
                return Some(Err(e));
            }
            if let Err(e) = self.pull_b() {
                return Some(Err(e));
            }
        }
        match (self.slot_a.take(), self.slot_b.take()) {
            (None, None) => None,
            (Some((_, a)), None) => {
                if let Err(e) = self.pull_a() {
                    return Some(Err(e));
                }
                Some(Ok((Some(a), None)))
            }
            (None, Some((_, b))) => {
                if let Err(e) = self.pull_b() {
                    return Some(Err(e));
                }
                Some(Ok((None, Some(b))))
            }
            (Some((ka, a)), Some((kb, b))) => match ka.cmp(&kb) {
                std::cmp::Ordering::Less => {
                    self.slot_b = Some((kb, b));
                    if let Err(e) = self.pull_a() {
                        return Some(Err(e));
                    }
                    Some(Ok((Some(a), None)))
                }
                std::cmp::Ordering::Greater => {
                    self.slot_a = Some((ka, a));
                    if let Err(e) = self.pull_b() {
                        return Some(Err(e));
                    }
                    Some(Ok((None, Some(b))))
                }
                std::cmp::Ordering::Equal => {
                    if let Err(e) = self.pull_a().and_then(|_| self.pull_b()) {
                        return Some(Err(e));
                    }
                    Some(Ok((Some(a), Some(b))))
                }
            },
        }
    }
}

impl<A, B> MergeSorted<A, B>
where
    A: Iterator<Item = crate::error::Result<Item>>,
    B: Iterator<Item = crate::error::Result<Item>>,
{
    fn pull_a(&mut self) -> crate::error::Result<()> {
        self.slot_a = match self.a.next() {
            None => None,
            Some(Err(e)) => return Err(e),
            Some(Ok(item)) => Some((item.key()?, item)),
        };
        Ok(())
    }

    fn pull_b(&mut self) -> crate::error::Result<()> {
        self.slot_b = match self.b.next() {
            None => None,
            Some(Err(e)) => return Err(e),
            Some(Ok(item)) => Some((item.key()?, item)),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_parts() {
        assert!(match_part("*.log", "build.log"));
        assert!(!match_part("*.log", "build.log.bak"));
        assert!(match_part("?at", "cat"));
        assert!(!match_part("?at", "at"));
        assert!(match_part("[abc]at", "bat"));
        assert!(match_part("[!abc]at", "hat"));
        assert!(!match_part("[!abc]at", "cat"));
        assert!(match_part("[a-f]1", "d1"));
        assert!(!match_part("[a-f]1", "g1"));
        assert!(match_part("plain", "plain"));
    }

    #[test]
    fn rule_parsing() {
        assert!(Rule::parse("").is_none());
        assert!(Rule::parse("# comment").is_none());
        assert!(Rule::parse("/").is_none());
        assert!(Rule::parse(".").is_none());

        let rule = Rule::parse("/build/").unwrap();
        assert!(rule.anchored);
        assert_eq!(rule.parts, vec!["build"]);

        let rule = Rule::parse("!keep.log").unwrap();
        assert!(rule.invert);
    }

    #[test]
    fn unanchored_rules_match_trailing_parts() {
        let rule = Rule::parse("*.tmp").unwrap();
        let path = |s: &str| s.split('/').map(str::to_owned).collect::<Vec<_>>();
        assert_eq!(rule.check(&path("x.tmp")), Some(true));
        assert_eq!(rule.check(&path("deep/down/x.tmp")), Some(true));
        assert_eq!(rule.check(&path("x.tmp/inner")), None);
    }

    #[test]
    fn anchored_rules_match_whole_paths_only() {
        let rule = Rule::parse("/build").unwrap();
        let path = |s: &str| s.split('/').map(str::to_owned).collect::<Vec<_>>();
        assert_eq!(rule.check(&path("build")), Some(true));
        assert_eq!(rule.check(&path("sub/build")), None);
        assert_eq!(rule.check(&path("build/thing")), None);
    }

    #[test]
    fn ignore_cascade_and_inversion() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir_all(base.join("src")).unwrap();
        fs::write(base.join(IGNORE_FILE), "*.tmp\n").unwrap();
        fs::write(base.join("src").join(IGNORE_FILE), "!keep.tmp\n").unwrap();

        let ignore = Ignore::new(base);
        assert!(ignore.check(&base.join("x.tmp")));
        assert!(ignore.check(&base.join("src/y.tmp")));
        // The nearer ruleset answers first.
        assert!(!ignore.check(&base.join("src/keep.tmp")));
        assert!(!ignore.check(&base.join("src/main.rs")));
        // .tote at the base is always ignored; nested ones are not special.
        assert!(ignore.check(&base.join(".tote")));
        assert!(!ignore.check(&base.join("src/.tote")));
    }

    #[test]
    fn scan_yields_canonical_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir_all(base.join("a")).unwrap();
        fs::write(base.join("a/x"), b"1").unwrap();
        fs::write(base.join("a/y"), b"22").unwrap();
        fs::write(base.join("a.b"), b"sibling").unwrap();

        let names: Vec<String> = scan_tree_relative(base, None, false)
            .filter_map(|item| item.name().map(str::to_owned))
            .collect();
        assert_eq!(names, vec!["a", "a/x", "a/y", "a.b"]);
    }

    #[test]
    fn treescan_yields_roots_only_without_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/f"), b"x").unwrap();

        let found: Vec<PathBuf> =
            treescan(vec![dir.path().to_path_buf()], None, WalkOptions::default()).collect();
        assert_eq!(found, vec![dir.path().to_path_buf()]);

        let opts = WalkOptions {
            recursive: true,
            ..Default::default()
        };
        let found: Vec<PathBuf> = treescan(vec![dir.path().to_path_buf()], None, opts).collect();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn merge_pairs_by_name() {
        use crate::item::NamedItem;
        let make = |name: &str| Item::Missing(NamedItem::new(name));
        let a = vec![make("a"), make("b"), make("d")];
        let b = vec![make("b"), make("c")];
        let pairs: Vec<Pair> = merge_sorted(a.into_iter().map(Ok), b.into_iter().map(Ok))
            .collect::<crate::error::Result<_>>()
            .unwrap();
        let shape: Vec<(bool, bool)> = pairs
            .iter()
            .map(|(x, y)| (x.is_some(), y.is_some()))
            .collect();
        assert_eq!(
            shape,
            vec![(true, false), (true, true), (false, true), (true, false)]
        );
    }
}
