//! Chunk codec — wrap, compress, encrypt, and store one chunk of plaintext.
//!
//! # Encode pipeline
//!
//! ```text
//! plaintext
//!   → "blob\n" ‖ plaintext                    (inner frame)
//!   → "zlib\n" ‖ deflate(9)   iff smaller     (conditional compression)
//!   → AES-256-CTR, key = SHA-256(frame),      (convergent encryption,
//!                  counter = 128-bit BE zero   zero initial counter)
//!   → "blob\n" ‖ ciphertext                   (outer frame)
//!   → blob store                              (keyed by digest of the above)
//! ```
//!
//! Because the key is derived from the bytes being encrypted, identical
//! plaintexts produce identical ciphertexts and deduplicate to a single
//! stored blob.  The construction leaks equality of chunks and nothing more.
//! Counter reuse across distinct plaintexts cannot occur: distinct frames
//! yield distinct keys.
//!
//! Both `blob\n` markers are integrity sentinels; a decode that does not
//! find them fails with [`Error::NotABlob`] rather than returning garbage.

use std::io::{Read, Write};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::store::{sha256_hex, FileStore};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Marker prefixed to every framed byte sequence.
pub const BLOB_MARKER: &[u8] = b"blob\n";

/// Marker prefixed to a zlib-compressed frame.
pub const ZLIB_MARKER: &[u8] = b"zlib\n";

/// The only encryption scheme this build reads or writes.
pub const LOCK_AES256CTR: &str = "aes256ctr";

/// A chunk descriptor: one stored blob plus everything needed to recover
/// the original plaintext slice from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Original plaintext length in bytes.
    pub size: u64,
    /// Hex SHA-256 of the original plaintext.
    pub sha256: String,
    /// Encryption scheme identifier.
    pub lock: String,
    /// Hex of the 32-byte encryption key.
    pub key: String,
    /// Digest of the stored (encrypted) blob; its key in the store.
    pub data: String,
}

/// Run a plaintext chunk through the encode pipeline and store the result.
pub fn save_chunk(chunk: &[u8], store: &FileStore) -> Result<Chunk> {
    let framed = make_blob(chunk);
    let framed = compress(framed)?;
    let key: [u8; 32] = Sha256::digest(&framed).into();
    let sealed = make_blob(&apply_ctr(&key, &framed));
    let data = store.save(&sealed)?;
    Ok(Chunk {
        size: chunk.len() as u64,
        sha256: sha256_hex(chunk),
        lock: LOCK_AES256CTR.to_owned(),
        key: hex::encode(key),
        data,
    })
}

/// Reverse the encode pipeline for one chunk descriptor.
pub fn load_chunk(part: &Chunk, store: &FileStore) -> Result<Vec<u8>> {
    if part.lock != LOCK_AES256CTR {
        return Err(Error::UnknownLock(part.lock.clone()));
    }
    let key: [u8; 32] = hex::decode(&part.key)
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or(Error::BadKey)?;

    let sealed = store.load(&part.data)?;
    let framed = apply_ctr(&key, from_blob(&sealed)?);
    let framed = decompress(framed)?;
    Ok(from_blob(&framed)?.to_vec())
}

fn make_blob(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_MARKER.len() + data.len());
    out.extend_from_slice(BLOB_MARKER);
    out.extend_from_slice(data);
    out
}

/// Strip the `blob\n` marker, failing if it is absent.
fn from_blob(data: &[u8]) -> Result<&[u8]> {
    data.strip_prefix(BLOB_MARKER).ok_or(Error::NotABlob)
}

/// Compress with zlib level 9, keeping the result only if it is strictly
/// smaller than the input (including the `zlib\n` marker).
fn compress(data: Vec<u8>) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::from(ZLIB_MARKER), Compression::new(9));
    enc.write_all(&data)?;
    let candidate = enc.finish()?;
    if candidate.len() < data.len() {
        Ok(candidate)
    } else {
        Ok(data)
    }
}

/// Inflate a `zlib\n`-marked frame; anything else passes through unchanged.
fn decompress(data: Vec<u8>) -> Result<Vec<u8>> {
    let Some(compressed) = data.strip_prefix(ZLIB_MARKER) else {
        return Ok(data);
    };
    let mut out = Vec::new();
    ZlibDecoder::new(compressed).read_to_end(&mut out)?;
    Ok(out)
}

/// AES-256-CTR with an all-zero 128-bit big-endian counter.  CTR mode is its
/// own inverse, so this both encrypts and decrypts.
fn apply_ctr(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &[0u8; 16].into());
    cipher.apply_keystream(&mut out);
    out
}
