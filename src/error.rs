//! Crate-wide error type.
//!
//! The split between [`Error::Store`] and [`Error::Io`] is load-bearing:
//! blob-store failures abort the operation in progress, while ordinary file
//! I/O failures during a checkin are recorded on the affected item and the
//! checkin continues.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No `.tote/` in the given directory or any of its parents.
    #[error("no .tote in {} or any parent directory", .0.display())]
    NotAWorkdir(PathBuf),

    /// Blob store read/write failed.  Always fatal.
    #[error("blob store I/O: {0}")]
    Store(#[source] io::Error),

    #[error("blob {digest} not found in store")]
    BlobNotFound { digest: String },

    /// A digest string that is not 64 characters of lowercase hex.
    #[error("malformed blob digest: {0:?}")]
    BadDigest(String),

    /// Stored bytes that should begin with the `blob\n` marker do not.
    /// Indicates corruption or tampering.
    #[error("not a blob")]
    NotABlob,

    /// A chunk descriptor names an encryption scheme this build cannot apply.
    #[error("unknown lock type: {0}")]
    UnknownLock(String),

    /// A chunk descriptor's `key` field is not a 256-bit hex string.
    #[error("chunk key is not a 256-bit hex string")]
    BadKey,

    #[error("malformed item record: {0}")]
    Format(#[from] serde_json::Error),

    #[error("fold chunk is not valid UTF-8")]
    FoldEncoding(#[from] std::string::FromUtf8Error),

    #[error("unrecognized timestamp: {0:?}")]
    Timestamp(String),

    /// An item with neither `name` nor `name_min` reached a sorting stage.
    #[error("item has no name")]
    Unnamed,

    /// Fold items reference serialized streams, not file content.
    #[error("fold items must be unfolded before extraction")]
    Folded,

    #[error("{hook} exited with {status}")]
    Hook { hook: String, status: ExitStatus },

    #[error(transparent)]
    Io(#[from] io::Error),
}
