//! Streaming entry readers and writers.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use cask_chunk::pool;
use cask_cas::{BlockAccess, BlockId};

use crate::toc::Entry;
use crate::txn::Txn;
use crate::Result;

/// Lazy byte stream over one entry's chunks.
///
/// Blocks are fetched, verified, and decoded one at a time as the consumer
/// reads; a corrupt block short-circuits the stream.
pub struct EntryReader<'a> {
    access: &'a BlockAccess,
    blocks: VecDeque<BlockId>,
    cur: Vec<u8>,
    pos: usize,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(access: &'a BlockAccess, blocks: Vec<BlockId>) -> EntryReader<'a> {
        EntryReader {
            access,
            blocks: blocks.into(),
            cur: Vec::new(),
            pos: 0,
        }
    }

    /// Drains every remaining byte into `dst`, returning the count copied.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<u64> {
        let mut total = 0u64;
        if self.pos < self.cur.len() {
            dst.write_all(&self.cur[self.pos..])?;
            total += (self.cur.len() - self.pos) as u64;
            self.pos = self.cur.len();
        }
        while let Some(id) = self.blocks.pop_front() {
            let data = self.access.read_block(&id)?;
            dst.write_all(&data)?;
            total += data.len() as u64;
        }
        Ok(total)
    }

    /// Convenience: collects the remaining bytes.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.cur.len() {
                let n = buf.len().min(self.cur.len() - self.pos);
                buf[..n].copy_from_slice(&self.cur[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.blocks.pop_front() {
                None => return Ok(0),
                Some(id) => {
                    self.cur = self.access.read_block(&id).map_err(io::Error::other)?;
                    self.pos = 0;
                }
            }
        }
    }
}

/// Write sink that stages an entry on an open transaction when closed.
///
/// Bytes are buffered and driven through the chunking pipeline at
/// [`EntryWriter::close`]; dropping the writer without closing stages
/// nothing.
pub struct EntryWriter<'t, 'c> {
    txn: &'t mut Txn<'c>,
    path: String,
    entry: Entry,
    buf: Vec<u8>,
}

impl<'t, 'c> EntryWriter<'t, 'c> {
    pub(crate) fn new(txn: &'t mut Txn<'c>, path: String, entry: Entry) -> EntryWriter<'t, 'c> {
        EntryWriter {
            txn,
            path,
            entry,
            buf: pool::take_block(),
        }
    }

    /// Stages the buffered bytes as `path`'s new entry; returns the byte
    /// count written.
    pub fn close(self) -> Result<u64> {
        let EntryWriter {
            txn,
            path,
            entry,
            buf,
        } = self;
        let written = txn.write_file_entry(&path, buf.as_slice(), entry)?;
        pool::recycle(buf);
        Ok(written)
    }
}

impl Write for EntryWriter<'_, '_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Standalone write sink returned by the repository-level `writer_for`:
/// owns a write transaction and commits it on close.
pub struct CaskWriter<'c> {
    txn: Txn<'c>,
    path: String,
    entry: Entry,
    buf: Vec<u8>,
}

impl<'c> CaskWriter<'c> {
    pub(crate) fn new(txn: Txn<'c>, path: String, entry: Entry) -> CaskWriter<'c> {
        CaskWriter {
            txn,
            path,
            entry,
            buf: pool::take_block(),
        }
    }

    /// Stages the buffered bytes and commits the owned transaction.
    pub fn close(self) -> Result<u64> {
        let CaskWriter {
            mut txn,
            path,
            entry,
            buf,
        } = self;
        let written = txn.write_file_entry(&path, buf.as_slice(), entry)?;
        txn.commit()?;
        pool::recycle(buf);
        Ok(written)
    }
}

impl Write for CaskWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
