//! Chunk codec and stream-save round trips against a real on-disk store.

use proptest::prelude::*;
use tote::chunk::{load_chunk, save_chunk};
use tote::save::{save_stream, CHUNK_SIZE};
use tote::store::{sha256_hex, FileStore};

fn test_store() -> (tempfile::TempDir, FileStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::attach(dir.path());
    (dir, store)
}

fn count_blobs(root: &std::path::Path) -> usize {
    let mut count = 0;
    let mut work = vec![root.join("blobs")];
    while let Some(dir) = work.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                work.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}

#[test]
fn empty_stream_saves_to_nothing() {
    let (_dir, store) = test_store();
    let saved = save_stream(std::io::empty(), &store).unwrap();
    assert!(saved.content.is_empty());
    assert_eq!(saved.size, 0);
    assert_eq!(
        saved.sha256,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn saving_twice_stores_one_blob() {
    let (dir, store) = test_store();
    let first = save_stream(&b"hello"[..], &store).unwrap();
    let blobs_after_first = count_blobs(dir.path());
    let second = save_stream(&b"hello"[..], &store).unwrap();

    assert_eq!(first.content, second.content);
    assert_eq!(
        first.sha256,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(first.size, 5);
    assert_eq!(count_blobs(dir.path()), blobs_after_first);
    assert_eq!(blobs_after_first, 1);
}

#[test]
fn ten_mib_stream_is_one_chunk() {
    let (_dir, store) = test_store();
    let data = vec![b'A'; 10 * 1024 * 1024];
    let saved = save_stream(&data[..], &store).unwrap();
    assert_eq!(saved.content.len(), 1);
    assert_eq!(saved.size, 10_485_760);
    assert_eq!(saved.sha256, sha256_hex(&data));

    let restored = load_chunk(&saved.content[0], &store).unwrap();
    assert_eq!(restored, data);
}

#[test]
fn stream_larger_than_chunk_size_splits() {
    let (_dir, store) = test_store();
    let data = vec![0x5au8; CHUNK_SIZE + 17];
    let saved = save_stream(&data[..], &store).unwrap();
    assert_eq!(saved.content.len(), 2);
    assert_eq!(saved.content[0].size, CHUNK_SIZE as u64);
    assert_eq!(saved.content[1].size, 17);
    assert_eq!(saved.sha256, sha256_hex(&data));

    let mut restored = Vec::new();
    for part in &saved.content {
        restored.extend(load_chunk(part, &store).unwrap());
    }
    assert_eq!(restored, data);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn chunk_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let (_dir, store) = test_store();
        let part = save_chunk(&data, &store).unwrap();
        prop_assert_eq!(part.size, data.len() as u64);
        prop_assert_eq!(&part.sha256, &sha256_hex(&data));
        prop_assert_eq!(load_chunk(&part, &store).unwrap(), data);
    }

    #[test]
    fn identical_chunks_share_a_descriptor(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let (_dir, store) = test_store();
        let a = save_chunk(&data, &store).unwrap();
        let b = save_chunk(&data, &store).unwrap();
        prop_assert_eq!(a, b);
    }
}
