//! Streaming content-defined chunker.

use std::io::Read;

use crate::pool;
use crate::rabin::Rabin;
use crate::{ChunkError, Result, AVG_BLOCK, MAX_BLOCK, MIN_BLOCK};

/// Chunk size bounds. `avg` must be a power of two and `min <= avg <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub min: usize,
    pub avg: usize,
    pub max: usize,
}

impl Default for ChunkBounds {
    fn default() -> Self {
        ChunkBounds {
            min: MIN_BLOCK,
            avg: AVG_BLOCK,
            max: MAX_BLOCK,
        }
    }
}

impl ChunkBounds {
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            return Err(ChunkError::InvalidConfig {
                message: "min chunk size must be nonzero",
            });
        }
        if !self.avg.is_power_of_two() {
            return Err(ChunkError::InvalidConfig {
                message: "avg chunk size must be a power of two",
            });
        }
        if self.min > self.avg || self.avg > self.max {
            return Err(ChunkError::InvalidConfig {
                message: "chunk sizes must satisfy min <= avg <= max",
            });
        }
        Ok(())
    }
}

const READ_BUF: usize = 8 << 10;

/// Splits a byte stream into content-defined chunks.
///
/// Yields each chunk's bytes in a pooled buffer (see [`crate::pool`]);
/// callers should [`pool::recycle`] buffers after use. The sequence of chunk
/// lengths sums to the input length. A chunker is single-use: it consumes its
/// reader and is not restartable.
pub struct Chunker<R> {
    src: R,
    rabin: Rabin,
    bounds: ChunkBounds,
    avg_mask: u64,
    rbuf: Box<[u8]>,
    rpos: usize,
    rlen: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    /// Creates a chunker with the default bounds.
    pub fn new(src: R) -> Self {
        Self::with_bounds(src, ChunkBounds::default())
            .expect("default chunk bounds are valid")
    }

    /// Creates a chunker with explicit bounds.
    pub fn with_bounds(src: R, bounds: ChunkBounds) -> Result<Self> {
        bounds.validate()?;
        Ok(Chunker {
            src,
            rabin: Rabin::new(),
            bounds,
            avg_mask: (bounds.avg - 1) as u64,
            rbuf: vec![0u8; READ_BUF].into_boxed_slice(),
            rpos: 0,
            rlen: 0,
            eof: false,
        })
    }

    fn fill(&mut self) -> Result<()> {
        debug_assert_eq!(self.rpos, self.rlen);
        self.rpos = 0;
        self.rlen = 0;
        while !self.eof && self.rlen == 0 {
            match self.src.read(&mut self.rbuf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.rlen = n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChunkError::Io(e)),
            }
        }
        Ok(())
    }

    /// Returns the next chunk, or `None` at end of input.
    ///
    /// The cut point is the first position at least `min` bytes in where the
    /// fingerprint ends in `avg - 1`, with a forced cut at `max`. A final
    /// tail shorter than `min` is emitted as the last chunk.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = pool::take_block();
        self.rabin.reset();

        loop {
            if self.rpos == self.rlen {
                self.fill()?;
                if self.rlen == 0 {
                    break;
                }
            }

            let b = self.rbuf[self.rpos];
            self.rpos += 1;
            chunk.push(b);
            let fp = self.rabin.slide(b);

            let len = chunk.len();
            if len >= self.bounds.max
                || (len >= self.bounds.min && fp & self.avg_mask == self.avg_mask)
            {
                return Ok(Some(chunk));
            }
        }

        if chunk.is_empty() {
            pool::recycle(chunk);
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk_lengths(data: &[u8]) -> Vec<usize> {
        let mut lens = Vec::new();
        let mut chunker = Chunker::new(Cursor::new(data));
        while let Some(chunk) = chunker.next_chunk().unwrap() {
            lens.push(chunk.len());
            pool::recycle(chunk);
        }
        lens
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_lengths(&[]).is_empty());
    }

    #[test]
    fn min_sized_input_is_a_single_chunk() {
        assert_eq!(chunk_lengths(&vec![0x5a; MIN_BLOCK]), vec![MIN_BLOCK]);
    }

    #[test]
    fn short_tail_is_emitted() {
        let lens = chunk_lengths(b"tail");
        assert_eq!(lens, vec![4]);
    }

    #[test]
    fn max_bound_forces_a_cut() {
        // Zero bytes never match the cut mask, so every cut is forced at max.
        let lens = chunk_lengths(&vec![0u8; MAX_BLOCK + 5]);
        assert_eq!(lens, vec![MAX_BLOCK, 5]);
    }

    #[test]
    fn bounds_hold_for_random_input() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let mut data = vec![0u8; 16 * AVG_BLOCK];
        StdRng::seed_from_u64(0x1dea).fill_bytes(&mut data);

        let lens = chunk_lengths(&data);
        assert!(lens.len() >= 2, "random input should produce internal cuts");
        assert_eq!(lens.iter().sum::<usize>(), data.len());
        for (i, &len) in lens.iter().enumerate() {
            assert!(len <= MAX_BLOCK);
            if i + 1 < lens.len() {
                assert!(len >= MIN_BLOCK);
            }
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let mut data = vec![0u8; 8 * AVG_BLOCK];
        StdRng::seed_from_u64(7).fill_bytes(&mut data);

        assert_eq!(chunk_lengths(&data), chunk_lengths(&data));
    }

    #[test]
    fn shared_suffix_chunks_identically_after_resync() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let mut shared = vec![0u8; 12 * AVG_BLOCK];
        StdRng::seed_from_u64(99).fill_bytes(&mut shared);

        let mut a = b"prefix-a-".to_vec();
        a.extend_from_slice(&shared);
        let mut b = b"other-prefix-b-".to_vec();
        b.extend_from_slice(&shared);

        let la = chunk_lengths(&a);
        let lb = chunk_lengths(&b);
        // Once boundaries resynchronize inside the shared run, the remaining
        // cuts line up; compare the trailing chunks.
        let tail = la.len().min(lb.len()) - 1;
        assert!(tail >= 1);
        assert_eq!(la[la.len() - tail..], lb[lb.len() - tail..]);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let err = Chunker::with_bounds(
            Cursor::new(b"x"),
            ChunkBounds {
                min: 8,
                avg: 100,
                max: 200,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, ChunkError::InvalidConfig { .. }));
    }

    #[test]
    fn chunker_is_an_iterator() {
        let data = vec![1u8; MAX_BLOCK * 2];
        let total: usize = Chunker::new(Cursor::new(&data))
            .map(|c| {
                let c = c.unwrap();
                let len = c.len();
                pool::recycle(c);
                len
            })
            .sum();
        assert_eq!(total, data.len());
    }
}
