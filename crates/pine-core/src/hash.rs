//! Structural (content) hashing for [`Value`](crate::Value) trees.
//!
//! The hash is a SHA-256 digest over a canonical, prefix-framed encoding of
//! the tree: every node is preceded by a one-byte tag and a length, so no
//! two distinct trees can hash to the same byte stream. It is stable across
//! runs and platforms and cheap to compare/store as a map key.

use sha2::{Digest, Sha256};
use std::fmt;

const TAG_BLOB: u8 = 0;
const TAG_LIST: u8 = 1;

/// A 32-byte SHA-256 content hash of a [`Value`](crate::Value) tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// Hash a blob's bytes into `hasher`, framed with a tag and length so it
/// can never be confused with a list frame.
fn hash_blob_into(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update([TAG_BLOB]);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_list_header_into(hasher: &mut Sha256, len: usize) {
    hasher.update([TAG_LIST]);
    hasher.update((len as u64).to_le_bytes());
}

/// Recursively frame `bytes`/children into `hasher`. Lists recurse into
/// their children's own canonical frames rather than hashing children
/// first and mixing in digests, so the whole tree is hashed in one pass.
pub(crate) fn hash_blob(hasher: &mut Sha256, bytes: &[u8]) {
    hash_blob_into(hasher, bytes);
}

pub(crate) fn hash_list_header(hasher: &mut Sha256, len: usize) {
    hash_list_header_into(hasher, len);
}

pub(crate) fn finalize(hasher: Sha256) -> ContentHash {
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    ContentHash(out)
}

pub(crate) fn new_hasher() -> Sha256 {
    Sha256::new()
}
