//! # tote — content-addressed, encrypted, deduplicating archive for file trees
//!
//! Format guarantees (frozen):
//! - Every stored blob begins with the 5-byte marker `blob\n`; bytes lacking
//!   it are never interpreted as a blob
//! - Blobs are keyed by the SHA-256 of their bytes and are write-once; the
//!   `.part`-then-rename discipline means readers never see a partial blob
//! - Chunk encryption is convergent AES-256-CTR: key = SHA-256 of the
//!   compressed frame, counter = 128-bit big-endian zero.  Identical
//!   plaintexts deduplicate to one blob; equality of chunks is the only leak
//! - Compression is zlib level 9, used only when it wins, marked `zlib\n`
//! - Item streams are UTF-8 text: `---` separator lines framing JSON objects
//! - Names sort as POSIX path-part tuples; every stream a stage produces is
//!   in that order
//! - Snapshot and archive files are replaced atomically, never in place

pub mod error;
pub mod store;
pub mod chunk;
pub mod item;
pub mod save;
pub mod scan;
pub mod fold;
pub mod checkin;
pub mod workdir;

// Flat re-exports for the most common types.
pub use error::{Error, Result};
pub use store::{FileStore, sha256_hex};
pub use chunk::{Chunk, save_chunk, load_chunk, LOCK_AES256CTR};
pub use item::{Item, ItemReader, ItemWriter, PathKey, path_key, from_stream, to_stream};
pub use save::{save_file, save_stream, stat_item, load_content, extract_file, CHUNK_SIZE};
pub use scan::{Ignore, TreeScan, treescan, scan_tree_relative, merge_sorted, WalkOptions};
pub use fold::{fold, fold_with_size, unfold, save_fold, FOLD_SIZE};
pub use checkin::{
    Change, checkin_save, checkin_status, most_recent_checkin, read_items, write_checkin,
    run_hook, append_history, replace_archive,
};
pub use workdir::{WorkDir, Config, find_workdir, is_workdir};
