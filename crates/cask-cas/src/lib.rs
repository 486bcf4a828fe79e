//! # cask-cas
//!
//! Content-addressed block storage for the cask object store.
//!
//! Blocks are opaque chunks of file data addressed by the BLAKE2b-256 digest
//! of their plaintext. On disk each block lives under a fanout directory
//! derived from its digest:
//!
//! ```text
//! <root>/blocks/
//! └── ab12cd/
//!     └── ab12cd...ef    # full 64-char hex digest
//! ```
//!
//! Every block passes through the repository's transform pipeline on its way
//! to and from disk: compression then encryption on write, the inverse pair
//! on read. Reads re-digest the recovered plaintext and fail with
//! [`CasError::CorruptBlock`] on mismatch.
//!
//! The [`BlockIndex`] is the repository's catalog of known blocks with
//! per-block reference counts, persisted wholesale at `<root>/blocks.idx`.

mod compress;
mod crypto;
mod index;
mod store;
mod transform;

pub use compress::{Lz4Reader, Lz4Writer};
pub use crypto::{Key, CRYPTO_OVERHEAD};
pub use index::{BlockIndex, BlockInfo};
pub use store::BlockStore;
pub use transform::{BlockAccess, BlockTransform, PipelineConfig};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use thiserror::Error;

/// 32-byte BLAKE2b-256 digest of a block's plaintext; its on-disk address.
pub type BlockId = [u8; 32];

pub(crate) type Blake2b256 = Blake2b<U32>;

/// Errors from block storage, transforms, and the block index.
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt block detected: {id}")]
    CorruptBlock { id: String },

    #[error("block frame truncated")]
    Truncated,

    #[error("payload too large for compression frame: {len} bytes")]
    PayloadTooLarge { len: usize },

    #[error("compression error: {0}")]
    Compress(#[from] lz4_flex::block::CompressError),

    #[error("decompression error: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("encryption failure")]
    Crypto,

    #[error("serialization error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Computes the BLAKE2b-256 digest of `data`.
pub fn block_id(data: &[u8]) -> BlockId {
    let mut h = Blake2b256::new();
    h.update(data);
    h.finalize().into()
}

/// Incremental digest-of-digests over an ordered sequence of [`BlockId`]s.
///
/// Used as a whole-file content hash: hashing the concatenated chunk digests
/// identifies the file without re-reading its data.
#[derive(Default)]
pub struct SetDigest(Blake2b256);

impl SetDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, id: &BlockId) {
        self.0.update(id);
    }

    pub fn finalize(self) -> BlockId {
        self.0.finalize().into()
    }
}

/// Converts a digest to its lowercase hex representation.
pub fn id_to_hex(id: &BlockId) -> String {
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parses a 64-character hex string back into a digest.
pub fn hex_to_id(hex: &str) -> Option<BlockId> {
    if hex.len() != 64 {
        return None;
    }
    let mut id = [0u8; 32];
    for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(pair).ok()?;
        id[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_is_stable() {
        assert_eq!(block_id(b"hello"), block_id(b"hello"));
        assert_ne!(block_id(b"hello"), block_id(b"goodbye"));
    }

    #[test]
    fn set_digest_matches_concatenation() {
        let a = block_id(b"a");
        let b = block_id(b"b");

        let mut sd = SetDigest::new();
        sd.update(&a);
        sd.update(&b);

        let mut concat = Vec::new();
        concat.extend_from_slice(&a);
        concat.extend_from_slice(&b);
        assert_eq!(sd.finalize(), block_id(&concat));
    }

    #[test]
    fn hex_is_lowercase_and_full_width() {
        let hex = id_to_hex(&[0xab; 32]);
        assert_eq!(hex.len(), 64);
        assert_eq!(&hex[..6], "ababab");
    }

    #[test]
    fn hex_roundtrips() {
        let id = block_id(b"roundtrip");
        assert_eq!(hex_to_id(&id_to_hex(&id)), Some(id));
        assert_eq!(hex_to_id("short"), None);
        assert_eq!(hex_to_id(&"zz".repeat(32)), None);
    }
}
