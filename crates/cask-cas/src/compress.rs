//! LZ4 block-mode compression transforms.
//!
//! Frame layout: a 2-byte little-endian plaintext length followed by the LZ4
//! block. A length of zero means the payload did not compress and is stored
//! verbatim.

use cask_chunk::pool;
use lz4_flex::block;

use crate::transform::BlockTransform;
use crate::{CasError, Result};

pub struct Lz4Writer;

impl BlockTransform for Lz4Writer {
    fn transform(&self, src: &[u8]) -> Result<Vec<u8>> {
        // The frame length field is 16 bits; larger payloads would wrap.
        if src.len() > u16::MAX as usize {
            return Err(CasError::PayloadTooLarge { len: src.len() });
        }

        let bound = block::get_maximum_output_size(src.len());
        let mut out = pool::take_block();
        out.resize(2 + bound, 0);

        let clen = block::compress_into(src, &mut out[2..])?;
        if clen >= src.len() {
            // Not compressible; store verbatim behind a zero length field.
            out[0] = 0;
            out[1] = 0;
            out[2..2 + src.len()].copy_from_slice(src);
            out.truncate(2 + src.len());
        } else {
            out[..2].copy_from_slice(&(src.len() as u16).to_le_bytes());
            out.truncate(2 + clen);
        }
        Ok(out)
    }
}

pub struct Lz4Reader;

impl BlockTransform for Lz4Reader {
    fn transform(&self, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() < 2 {
            return Err(CasError::Truncated);
        }
        let plen = u16::from_le_bytes([src[0], src[1]]) as usize;
        let payload = &src[2..];

        let mut out = pool::take_block();
        if plen == 0 {
            // Stored verbatim.
            out.extend_from_slice(payload);
            return Ok(out);
        }

        out.resize(plen, 0);
        let n = block::decompress_into(payload, &mut out)?;
        out.truncate(n);
        Ok(out)
    }
}
