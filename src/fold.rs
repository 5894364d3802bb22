//! Fold/unfold — pack long item streams into bounded chunks and back.
//!
//! Folding replaces runs of items with single fold items, each referencing
//! one stored chunk holding the serialized run plus the bounding names.
//! Fold items are items, so folding composes: folding a folded stream adds
//! another level, and any stream becomes a bounded handful of records.
//!
//! Unfolding is a k-way merge over lazily expanded folds: a min-heap keyed
//! by canonical name yields the next item; popping a fold loads and parses
//! its chunk and pushes the inner items back on the heap.  Folds reference
//! blobs, never stream positions, so expansion always terminates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::mem;

use crate::chunk::{load_chunk, save_chunk};
use crate::error::Result;
use crate::item::{from_stream, to_stream, FoldItem, Item, PathKey};
use crate::store::FileStore;

/// Target serialized size of one fold page: 2^22 bytes.
pub const FOLD_SIZE: usize = 1 << 22;

/// Pack one page of items into a single fold item.
///
/// The page is sorted by canonical name, serialized as an item stream, and
/// stored as one chunk.  The page must not be empty.
pub fn save_fold(page: Vec<Item>, store: &FileStore) -> Result<Item> {
    let mut keyed: Vec<(PathKey, Item)> = page
        .into_iter()
        .map(|item| Ok((item.key()?, item)))
        .collect::<Result<_>>()?;
    keyed.sort_by(|x, y| x.0.cmp(&y.0));

    let mut text = String::new();
    for (_, item) in &keyed {
        text.push_str(&to_stream(item)?);
    }
    let chunk = save_chunk(text.as_bytes(), store)?;

    let name_min = keyed
        .first()
        .and_then(|(_, item)| item.sort_name())
        .unwrap_or_default()
        .to_owned();
    let name_max = keyed
        .last()
        .and_then(|(_, item)| item.sort_name())
        .unwrap_or_default()
        .to_owned();

    Ok(Item::Fold(FoldItem {
        content: vec![chunk],
        count: keyed.len() as u64,
        name_min,
        name_max,
        extra: Default::default(),
    }))
}

/// Fold an item stream into fold items, each page bounded by `fold_size`.
pub struct Fold<'a, I> {
    items: I,
    store: &'a FileStore,
    fold_size: usize,
    page: Vec<Item>,
    page_size: usize,
    carry: Option<(Item, usize)>,
    done: bool,
}

pub fn fold<I>(items: I, store: &FileStore) -> Fold<'_, I::IntoIter>
where
    I: IntoIterator<Item = Result<Item>>,
{
    fold_with_size(items, store, FOLD_SIZE)
}

pub fn fold_with_size<I>(items: I, store: &FileStore, fold_size: usize) -> Fold<'_, I::IntoIter>
where
    I: IntoIterator<Item = Result<Item>>,
{
    Fold {
        items: items.into_iter(),
        store,
        fold_size,
        page: Vec::new(),
        page_size: 0,
        carry: None,
        done: false,
    }
}

impl<I> Iterator for Fold<'_, I>
where
    I: Iterator<Item = Result<Item>>,
{
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some((item, len)) = self.carry.take() {
            self.page.push(item);
            self.page_size += len;
        }
        loop {
            match self.items.next() {
                None => {
                    self.done = true;
                    if self.page.is_empty() {
                        return None;
                    }
                    self.page_size = 0;
                    let page = mem::take(&mut self.page);
                    return Some(save_fold(page, self.store));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(item)) => {
                    let len = match to_stream(&item) {
                        Ok(text) => text.len(),
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    if self.page_size + len > self.fold_size && !self.page.is_empty() {
                        self.carry = Some((item, len));
                        self.page_size = 0;
                        let page = mem::take(&mut self.page);
                        return Some(save_fold(page, self.store));
                    }
                    self.page.push(item);
                    self.page_size += len;
                }
            }
        }
    }
}

// ── Unfold ───────────────────────────────────────────────────────────────────

struct HeapEntry {
    key: PathKey,
    // Insertion order breaks ties so equal names come out in input order.
    seq: u64,
    item: Item,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Lazily expand folds, yielding non-fold items in canonical name order.
pub struct Unfold<'a> {
    heap: BinaryHeap<std::cmp::Reverse<HeapEntry>>,
    store: &'a FileStore,
    seq: u64,
}

pub fn unfold<I>(items: I, store: &FileStore) -> Result<Unfold<'_>>
where
    I: IntoIterator<Item = Item>,
{
    let mut out = Unfold {
        heap: BinaryHeap::new(),
        store,
        seq: 0,
    };
    for item in items {
        out.push(item)?;
    }
    Ok(out)
}

impl Unfold<'_> {
    fn push(&mut self, item: Item) -> Result<()> {
        let key = item.key()?;
        self.heap.push(std::cmp::Reverse(HeapEntry {
            key,
            seq: self.seq,
            item,
        }));
        self.seq += 1;
        Ok(())
    }

    fn expand(&mut self, fold: FoldItem) -> Result<()> {
        for part in &fold.content {
            let bytes = load_chunk(part, self.store)?;
            let text = String::from_utf8(bytes)?;
            for item in from_stream(&text)? {
                self.push(item)?;
            }
        }
        Ok(())
    }
}

impl Iterator for Unfold<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let std::cmp::Reverse(entry) = self.heap.pop()?;
            match entry.item {
                Item::Fold(fold) => {
                    if let Err(e) = self.expand(fold) {
                        return Some(Err(e));
                    }
                }
                item => return Some(Ok(item)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::NamedItem;

    fn test_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::attach(dir.path());
        (dir, store)
    }

    fn make(name: &str) -> Item {
        Item::Missing(NamedItem::new(name))
    }

    #[test]
    fn fold_then_unfold_is_sort() {
        let (_dir, store) = test_store();
        let items = vec![make("c"), make("a"), make("b/2"), make("b")];

        let folded: Vec<Item> = fold(items.clone().into_iter().map(Ok), &store)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(folded.len(), 1);
        let Item::Fold(f) = &folded[0] else {
            panic!("expected fold, got {:?}", folded[0]);
        };
        assert_eq!(f.count, 4);
        assert_eq!(f.name_min, "a");
        assert_eq!(f.name_max, "c");

        let unfolded: Vec<Item> = unfold(folded, &store)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let names: Vec<&str> = unfolded.iter().filter_map(Item::name).collect();
        assert_eq!(names, vec!["a", "b", "b/2", "c"]);
    }

    #[test]
    fn small_fold_size_makes_many_pages() {
        let (_dir, store) = test_store();
        let items: Vec<Item> = (0..100).map(|i| make(&format!("n{i:03}"))).collect();

        let folded: Vec<Item> = fold_with_size(items.clone().into_iter().map(Ok), &store, 512)
            .collect::<Result<_>>()
            .unwrap();
        assert!(folded.len() > 1, "expected several pages, got {}", folded.len());

        let total: u64 = folded
            .iter()
            .map(|f| match f {
                Item::Fold(f) => f.count,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 100);

        let unfolded: Vec<Item> = unfold(folded, &store)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(unfolded, items);
    }

    #[test]
    fn nested_folds_unfold_flat() {
        let (_dir, store) = test_store();
        let items: Vec<Item> = (0..50).map(|i| make(&format!("n{i:02}"))).collect();

        let level1: Vec<Item> = fold_with_size(items.clone().into_iter().map(Ok), &store, 256)
            .collect::<Result<_>>()
            .unwrap();
        let level2: Vec<Item> = fold_with_size(level1.into_iter().map(Ok), &store, 1024)
            .collect::<Result<_>>()
            .unwrap();
        assert!(level2.iter().all(|i| matches!(i, Item::Fold(_))));

        let unfolded: Vec<Item> = unfold(level2, &store)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(unfolded, items);
    }

    #[test]
    fn unfold_passes_plain_items_through_sorted() {
        let (_dir, store) = test_store();
        let items = vec![make("z"), make("m"), make("a")];
        let unfolded: Vec<Item> = unfold(items, &store)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let names: Vec<&str> = unfolded.iter().filter_map(Item::name).collect();
        assert_eq!(names, vec!["a", "m", "z"]);
    }
}
