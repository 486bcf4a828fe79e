//! Thread-local byte-buffer pools.
//!
//! Two pools back the store's hot paths: a small pool (~1 KiB buffers) for
//! serialized indices and a block pool (twice the average chunk) for chunk
//! payloads and transform outputs. Callers take a buffer, fill it, and hand
//! it back with [`recycle`] once the consumer is done with it.

use std::cell::RefCell;

use crate::AVG_BLOCK;

/// Capacity of buffers in the small pool.
pub const SMALL_BUFFER: usize = 1024;
/// Capacity of buffers in the block pool.
pub const BLOCK_BUFFER: usize = AVG_BLOCK * 2;

/// Buffers kept per thread per pool.
const MAX_POOLED: usize = 8;

thread_local! {
    static SMALL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
    static BLOCK: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Takes an empty buffer with at least [`SMALL_BUFFER`] capacity.
pub fn take_small() -> Vec<u8> {
    SMALL.with(|pool| {
        pool.borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(SMALL_BUFFER))
    })
}

/// Takes an empty buffer with at least [`BLOCK_BUFFER`] capacity.
pub fn take_block() -> Vec<u8> {
    BLOCK.with(|pool| {
        pool.borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BLOCK_BUFFER))
    })
}

/// Returns a buffer to the pool it came from, keyed by capacity.
///
/// Oversized buffers (grown past twice the block size) are dropped rather
/// than pooled.
pub fn recycle(mut buf: Vec<u8>) {
    buf.clear();
    let cap = buf.capacity();
    let pool = if cap >= BLOCK_BUFFER && cap <= BLOCK_BUFFER * 2 {
        &BLOCK
    } else if cap >= SMALL_BUFFER && cap < BLOCK_BUFFER {
        &SMALL
    } else {
        return;
    };
    pool.with(|p| {
        let mut p = p.borrow_mut();
        if p.len() < MAX_POOLED {
            p.push(buf);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_yields_empty_buffer_with_capacity() {
        let buf = take_block();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BLOCK_BUFFER);
        recycle(buf);
    }

    #[test]
    fn recycle_reuses_allocation() {
        let mut buf = take_small();
        buf.extend_from_slice(b"scratch");
        let ptr = buf.as_ptr();
        recycle(buf);

        let again = take_small();
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
        recycle(again);
    }

    #[test]
    fn oversized_buffers_are_dropped() {
        let buf = vec![0u8; BLOCK_BUFFER * 4];
        recycle(buf);
        let fresh = take_block();
        assert!(fresh.capacity() < BLOCK_BUFFER * 3);
        recycle(fresh);
    }
}
