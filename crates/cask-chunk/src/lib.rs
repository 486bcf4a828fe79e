//! # cask-chunk
//!
//! Content-defined chunking for the cask object store.
//!
//! A [`Chunker`] splits an input stream into variable-sized chunks whose
//! boundaries are chosen by a Rabin fingerprint over a 64-byte sliding
//! window. Boundaries depend only on content, so identical byte runs chunk
//! identically regardless of their position in a file — the basis of
//! cross-file and cross-write deduplication.
//!
//! ## Cut rule
//!
//! A chunk ends at the first position at least [`MIN_BLOCK`] bytes in where
//! the fingerprint satisfies `fp & (AVG_BLOCK - 1) == AVG_BLOCK - 1`, with a
//! forced cut at [`MAX_BLOCK`]. A final tail shorter than `MIN_BLOCK` is
//! emitted as the last chunk.

mod chunker;
mod rabin;

pub mod pool;

pub use chunker::{ChunkBounds, Chunker};
pub use rabin::WINDOW;

use thiserror::Error;

/// Minimum chunk size in bytes.
pub const MIN_BLOCK: usize = 512;
/// Average (target) chunk size in bytes. Must be a power of two.
pub const AVG_BLOCK: usize = 4 << 10;
/// Maximum chunk size in bytes; a cut is forced here.
pub const MAX_BLOCK: usize = 32 << 10;

/// Errors that can occur during chunking.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunker config: {message}")]
    InvalidConfig { message: &'static str },
}

pub type Result<T> = std::result::Result<T, ChunkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn default_bounds_are_valid() {
        ChunkBounds::default().validate().unwrap();
    }

    #[test]
    fn chunk_lengths_sum_to_input() {
        let data = vec![7u8; 3 * MAX_BLOCK + 123];
        let mut chunker = Chunker::new(Cursor::new(&data));
        let mut total = 0;
        while let Some(chunk) = chunker.next_chunk().unwrap() {
            total += chunk.len();
            pool::recycle(chunk);
        }
        assert_eq!(total, data.len());
    }
}
