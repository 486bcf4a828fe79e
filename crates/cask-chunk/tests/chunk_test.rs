//! Chunker behavior through the public API.

use std::io::Cursor;

use cask_chunk::{pool, ChunkBounds, Chunker, AVG_BLOCK, MAX_BLOCK, MIN_BLOCK};

fn lengths_of(data: &[u8]) -> Vec<usize> {
    Chunker::new(Cursor::new(data))
        .map(|chunk| {
            let chunk = chunk.unwrap();
            let len = chunk.len();
            pool::recycle(chunk);
            len
        })
        .collect()
}

#[test]
fn cuts_respect_min_and_max_bounds() {
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    let mut data = vec![0u8; 64 * AVG_BLOCK];
    StdRng::seed_from_u64(0xcafe).fill_bytes(&mut data);

    let lens = lengths_of(&data);
    assert!(lens.len() > 4);
    assert_eq!(lens.iter().sum::<usize>(), data.len());

    for &len in &lens[..lens.len() - 1] {
        assert!((MIN_BLOCK..=MAX_BLOCK).contains(&len));
    }
    assert!(*lens.last().unwrap() <= MAX_BLOCK);
}

#[test]
fn boundaries_are_position_independent_within_a_stream() {
    // Appending data after a cut must not change the cuts before it.
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    let mut data = vec![0u8; 16 * AVG_BLOCK];
    StdRng::seed_from_u64(0xbeef).fill_bytes(&mut data);

    let short = lengths_of(&data);
    let mut extended = data.clone();
    extended.extend_from_slice(&[0x42; 1024]);
    let long = lengths_of(&extended);

    assert!(short.len() >= 2);
    assert_eq!(short[..short.len() - 1], long[..short.len() - 1]);
}

#[test]
fn custom_bounds_are_honored() {
    let bounds = ChunkBounds {
        min: 64,
        avg: 256,
        max: 1024,
    };
    let data = vec![0u8; 4096 + 10];
    let mut chunker = Chunker::with_bounds(Cursor::new(&data), bounds).unwrap();

    let mut lens = Vec::new();
    while let Some(chunk) = chunker.next_chunk().unwrap() {
        lens.push(chunk.len());
        pool::recycle(chunk);
    }
    // Zeros never match the cut mask, so every cut is the forced max.
    assert_eq!(lens, vec![1024, 1024, 1024, 1024, 10]);
}

#[test]
fn small_reads_and_large_reads_chunk_identically() {
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use std::io::Read;

    // A reader that returns at most 7 bytes per call.
    struct Dribble<'a>(&'a [u8]);
    impl Read for Dribble<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(7).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    let mut data = vec![0u8; 8 * AVG_BLOCK];
    StdRng::seed_from_u64(3).fill_bytes(&mut data);

    let whole = lengths_of(&data);
    let dribbled: Vec<usize> = Chunker::new(Dribble(&data))
        .map(|chunk| {
            let chunk = chunk.unwrap();
            let len = chunk.len();
            pool::recycle(chunk);
            len
        })
        .collect();
    assert_eq!(whole, dribbled);
}
