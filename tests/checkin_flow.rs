//! End-to-end checkin scenarios against a real workspace on disk.

use std::fs;
use std::path::Path;

use tote::checkin::{checkin_save, checkin_status, most_recent_checkin, read_items, write_checkin, Change};
use tote::fold::unfold;
use tote::item::Item;
use tote::scan::Ignore;
use tote::store::FileStore;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".tote")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self) -> FileStore {
        FileStore::attach(self.root().join(".tote"))
    }

    fn checkin(&self) -> std::path::PathBuf {
        let store = self.store();
        let ignore = Ignore::new(self.root());
        let items = checkin_save(self.root(), &ignore, &store).unwrap();
        write_checkin(self.root(), &store, items).unwrap()
    }

    fn unfold_snapshot(&self, path: &Path) -> Vec<Item> {
        let store = self.store();
        let items = read_items(path).unwrap();
        unfold(items, &store)
            .unwrap()
            .collect::<tote::Result<_>>()
            .unwrap()
    }
}

#[test]
fn checkin_of_small_tree() {
    let fx = Fixture::new();
    fs::create_dir(fx.root().join("a")).unwrap();
    fs::write(fx.root().join("a/x"), b"1").unwrap();
    fs::write(fx.root().join("a/y"), b"22").unwrap();

    let snapshot = fx.checkin();
    assert!(snapshot.to_string_lossy().ends_with(".tote"));
    assert!(fs::metadata(&snapshot).unwrap().len() > 0);

    let items = fx.unfold_snapshot(&snapshot);
    let summary: Vec<(&str, &str)> = items
        .iter()
        .map(|item| (item.type_name(), item.name().unwrap()))
        .collect();
    assert_eq!(
        summary,
        vec![("dir", "a"), ("file", "a/x"), ("file", "a/y")]
    );

    // Saved content restores byte for byte.
    let store = fx.store();
    let Item::File(f) = &items[1] else {
        panic!("expected file item");
    };
    assert_eq!(f.size, Some(1));
    let mut restored = Vec::new();
    for part in f.content.as_ref().unwrap() {
        restored.extend(tote::load_chunk(part, &store).unwrap());
    }
    assert_eq!(restored, b"1");
}

#[test]
fn unchanged_tree_checks_in_identically() {
    let fx = Fixture::new();
    fs::create_dir(fx.root().join("src")).unwrap();
    fs::write(fx.root().join("src/lib"), b"fn main() {}").unwrap();
    fs::write(fx.root().join("README"), b"hello").unwrap();

    let first = fx.checkin();
    let second = fx.checkin();
    assert_ne!(first, second);
    assert_eq!(most_recent_checkin(fx.root()).unwrap(), second);

    let a = fx.unfold_snapshot(&first);
    let b = fx.unfold_snapshot(&second);
    assert_eq!(a, b);

    // No spurious re-save: file items share chunk references.
    for (x, y) in a.iter().zip(&b) {
        if let (Item::File(x), Item::File(y)) = (x, y) {
            assert_eq!(x.content, y.content);
        }
    }
}

#[test]
fn changes_are_detected_and_applied() {
    let fx = Fixture::new();
    fs::write(fx.root().join("keep"), b"same").unwrap();
    fs::write(fx.root().join("edit"), b"one").unwrap();
    fs::write(fx.root().join("drop"), b"bye").unwrap();
    fx.checkin();

    fs::write(fx.root().join("edit"), b"changed!").unwrap();
    fs::remove_file(fx.root().join("drop")).unwrap();
    fs::write(fx.root().join("fresh"), b"new file").unwrap();

    let store = fx.store();
    let ignore = Ignore::new(fx.root());
    let changes: Vec<Change> = checkin_status(fx.root(), &ignore, &store)
        .unwrap()
        .collect::<tote::Result<_>>()
        .unwrap();
    assert!(changes.contains(&Change::Deleted("drop".into())));
    assert!(changes.contains(&Change::New("fresh".into())));
    assert!(changes.contains(&Change::Updated("edit".into())));
    assert!(!changes.iter().any(|c| matches!(c, Change::Updated(n) if n == "keep")));

    let snapshot = fx.checkin();
    let items = fx.unfold_snapshot(&snapshot);
    let names: Vec<&str> = items.iter().filter_map(Item::name).collect();
    assert_eq!(names, vec!["edit", "fresh", "keep"]);

    let Item::File(edit) = &items[0] else {
        panic!("expected file item");
    };
    assert_eq!(edit.size, Some(8));
}

#[test]
fn ignored_paths_stay_out_of_snapshots() {
    let fx = Fixture::new();
    fs::write(fx.root().join(".toteignore"), "*.log\n").unwrap();
    fs::write(fx.root().join("build.log"), b"noise").unwrap();
    fs::write(fx.root().join("main"), b"signal").unwrap();

    let snapshot = fx.checkin();
    let items = fx.unfold_snapshot(&snapshot);
    let names: Vec<&str> = items.iter().filter_map(Item::name).collect();
    // .toteignore itself is versioned; .tote and *.log are not.
    assert_eq!(names, vec![".toteignore", "main"]);
}

#[test]
fn committed_snapshots_leave_no_part_files() {
    let fx = Fixture::new();
    fs::write(fx.root().join("f"), b"data").unwrap();
    fx.checkin();
    fx.checkin();

    let dir = fx.root().join(".tote/checkin/default");
    for entry in fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(name.ends_with(".tote"), "unexpected leftover {name}");
    }
}
