//! Read and write transactions.
//!
//! A transaction snapshots the TOC and block index when it opens. Read
//! transactions are immutable views. A write transaction additionally holds
//! the repository's writer mutex and the on-disk advisory lock for its
//! lifetime; it stages entry updates and removals and publishes them at
//! [`Txn::commit`]:
//!
//! 1. compose the new TOC and index payloads,
//! 2. replace the head file by atomic rename,
//! 3. garbage-collect against every head,
//! 4. rewrite `blocks.idx`.
//!
//! If step 2 lands but a later step is interrupted, readers still observe a
//! consistent head whose blocks all exist; orphan blocks and a stale index
//! are reclaimed by the next commit. Dropping an uncommitted transaction
//! discards everything it staged.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::sync::MutexGuard;

use tracing::{debug, instrument};

use cask_chunk::{pool, Chunker};
use cask_cas::{block_id, id_to_hex, BlockId, BlockIndex, BlockInfo, SetDigest};

use crate::cancel::CancelToken;
use crate::io::{EntryReader, EntryWriter};
use crate::lock::RepoLock;
use crate::toc::{unmarshal_head, BlockSet, Entry, EntryKind, Toc, TocHeader};
use crate::{Cask, FsError, Result};

pub struct Txn<'c> {
    pub(crate) cask: &'c Cask,
    write: bool,
    _guard: Option<MutexGuard<'c, ()>>,
    _lock: Option<RepoLock>,
    toc: Toc,
    updates: Toc,
    removals: Vec<String>,
    index: BlockIndex,
    toc_set: Option<BlockSet>,
    index_set: Option<BlockSet>,
    header: TocHeader,
    cancel: CancelToken,
}

impl<'c> Txn<'c> {
    pub(crate) fn open(cask: &'c Cask, write: bool) -> Result<Txn<'c>> {
        if write && cask.read_only {
            return Err(FsError::ReadOnly);
        }
        let guard = if write {
            Some(cask.writer_mu.lock().unwrap())
        } else {
            None
        };
        let lock = if write {
            Some(RepoLock::acquire(&cask.root.join(".lock"))?)
        } else {
            None
        };
        let toc = cask.toc.lock().unwrap().clone();
        let index = cask.index.read().unwrap().clone();
        let toc_set = cask.toc_set.lock().unwrap().clone();
        let index_set = cask.index_set.lock().unwrap().clone();

        Ok(Txn {
            cask,
            write,
            _guard: guard,
            _lock: lock,
            toc,
            updates: Toc::default(),
            removals: Vec::new(),
            index,
            toc_set,
            index_set,
            header: cask.header.clone(),
            cancel: CancelToken::new(),
        })
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Signal that cancels this transaction's in-flight writes.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn require_write(&self) -> Result<()> {
        if !self.write {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Looks a path up with staged updates shadowing the base TOC.
    pub(crate) fn entry_for(&self, path: &str) -> Option<&Entry> {
        self.updates
            .paths
            .get(path)
            .or_else(|| self.toc.paths.get(path))
    }

    /// Returns a lazy reader over the path's chunks.
    pub fn reader_for(&self, path: &str) -> Result<EntryReader<'c>> {
        let entry = self.entry_for(path).ok_or(FsError::NotFound)?;
        Ok(EntryReader::new(
            &self.cask.access,
            entry.blocks.blocks.clone(),
        ))
    }

    /// Returns a sink that stages an entry for `path` when closed.
    pub fn writer_for<'t>(&'t mut self, path: &str) -> Result<EntryWriter<'t, 'c>> {
        self.require_write()?;
        let entry = self
            .entry_for(path)
            .cloned()
            .unwrap_or_else(Entry::new_file);
        Ok(EntryWriter::new(self, path.to_string(), entry))
    }

    /// Drains `src` through the chunking pipeline and stages an entry.
    /// Returns the number of bytes written.
    pub fn write_file<R: Read>(&mut self, path: &str, src: R) -> Result<u64> {
        self.require_write()?;
        self.write_file_entry(path, src, Entry::new_file())
    }

    /// Like [`Txn::write_file`] but captures permissions, owner names, and
    /// timestamps from the source file. Metadata capture is best-effort and
    /// never fails the write; non-regular inputs are rejected.
    pub fn copy_file(&mut self, path: &str, file: &fs::File) -> Result<u64> {
        self.require_write()?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(FsError::UnsupportedFileKind);
        }
        let mut entry = Entry::new_file();
        capture_metadata(&mut entry, &meta);
        self.write_file_entry(path, file, entry)
    }

    /// Stages removal of `path`; applied at commit.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.require_write()?;
        if self.entry_for(path).is_none() {
            return Err(FsError::NotFound);
        }
        self.removals.push(path.to_string());
        Ok(())
    }

    /// Flushes the TOC and copies the current head file to `heads/<name>`.
    pub fn create_snapshot(&mut self, name: &str) -> Result<()> {
        self.require_write()?;
        self.flush_toc()?;
        let src = self.cask.head_path();
        let dst = self.cask.root.join("heads").join(name);
        fs::copy(&src, &dst)?;
        debug!(name, "created snapshot");
        Ok(())
    }

    /// Publishes staged state. No-op for read transactions.
    #[instrument(skip(self), level = "debug")]
    pub fn commit(mut self) -> Result<()> {
        if !self.write {
            return Ok(());
        }
        self.flush_toc()?;
        self.gc_blocks()?;
        self.flush_block_toc()?;
        Ok(())
    }

    pub(crate) fn write_file_entry<R: Read>(
        &mut self,
        path: &str,
        src: R,
        mut entry: Entry,
    ) -> Result<u64> {
        let set = self.write_as_blocks(src)?;
        let written = set.byte_size;

        entry.kind = EntryKind::File;
        entry.byte_size = set.byte_size;
        entry.hash = set.sum;
        entry.blocks = set;

        // Restaging a path within one transaction releases the references
        // the earlier staging took.
        if let Some(prev) = self.updates.paths.insert(path.to_string(), entry) {
            self.release_blocks(&prev.blocks, true)?;
        }
        Ok(written)
    }

    /// The write pipeline: chunk, digest, dedup against the index, transform
    /// and store what is novel.
    fn write_as_blocks<R: Read>(&mut self, src: R) -> Result<BlockSet> {
        let mut chunker = Chunker::new(src);
        let mut ids = Vec::new();
        let mut digest = SetDigest::new();
        let mut total = 0u64;

        while let Some(chunk) = chunker.next_chunk()? {
            self.cancel.check()?;

            let id = block_id(&chunk);
            digest.update(&id);
            total += chunk.len() as u64;
            ids.push(id);

            if let Some(info) = self.index.find_mut(&id) {
                info.references += 1;
                pool::recycle(chunk);
                continue;
            }

            let stored_size = self.cask.access.write_block(&id, &chunk)?;
            self.index.add(BlockInfo {
                id,
                byte_size: chunk.len() as u64,
                stored_size,
                references: 1,
            });
            pool::recycle(chunk);
        }

        Ok(BlockSet {
            blocks: ids,
            sum: digest.finalize(),
            byte_size: total,
        })
    }

    /// Drops one reference per block in `set`. With `strict`, a block
    /// missing from the index means an entry pointed at storage the index
    /// never knew about.
    fn release_blocks(&mut self, set: &BlockSet, strict: bool) -> Result<()> {
        for id in &set.blocks {
            match self.index.find_mut(id) {
                Some(info) => {
                    info.references = info.references.saturating_sub(1);
                    if info.references == 0 {
                        self.index.remove(id);
                    }
                }
                None if strict => {
                    return Err(FsError::CorruptFile { id: id_to_hex(id) });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Merges staged state into the TOC, rechunks it, and atomically
    /// replaces the head file.
    fn flush_toc(&mut self) -> Result<()> {
        let mut shared_toc = self.cask.toc.lock().unwrap();

        let staged = std::mem::take(&mut self.updates.paths);
        for (path, entry) in staged {
            if let Some(prev) = self.toc.paths.insert(path, entry) {
                self.release_blocks(&prev.blocks, true)?;
            }
        }

        for path in std::mem::take(&mut self.removals) {
            if let Some(entry) = self.toc.paths.remove(&path) {
                self.release_blocks(&entry.blocks, true)?;
            }
        }

        // Store the TOC itself as blocks, then retire the previous TOC's
        // chunks. Chunking first lets an unchanged TOC dedup against them.
        let toc_bytes = bincode::serialize(&self.toc)?;
        let set = self.write_as_blocks(toc_bytes.as_slice())?;
        if let Some(prev) = self.toc_set.take() {
            self.release_blocks(&prev, false)?;
        }
        self.toc_set = Some(set.clone());

        let set_bytes = bincode::serialize(&set)?;
        let p_toc = self.cask.access.write_transform(&set_bytes)?;

        let mut header = self.header.clone();
        header.sum = block_id(&p_toc).to_vec();
        header.toc_size = p_toc.len() as i64;

        // The index grows without bound, so it is stored as blocks too; the
        // head embeds only its BlockSet, which fits a single transform frame
        // regardless of repository size.
        let index_bytes = bincode::serialize(&self.index)?;
        let index_set = self.write_as_blocks(index_bytes.as_slice())?;
        if let Some(prev) = self.index_set.take() {
            self.release_blocks(&prev, false)?;
        }
        self.index_set = Some(index_set.clone());

        let index_set_bytes = bincode::serialize(&index_set)?;
        let p_blocks = self.cask.access.write_transform(&index_set_bytes)?;
        header.blocks_size = p_blocks.len() as i64;

        let head_bytes = crate::toc::encode_head(&header, &p_toc, &p_blocks)?;
        crate::toc::write_head(&self.cask.root, &self.cask.head, &head_bytes)?;

        *shared_toc = self.toc.clone();
        debug!(
            head = %self.cask.head,
            paths = self.toc.paths.len(),
            "flushed table of contents"
        );
        Ok(())
    }

    /// Removes blocks no head can reach, from the index and from disk.
    ///
    /// Reference counts are authoritative for the current head only, so
    /// reachability is recomputed by scanning every head file: the union of
    /// each head's TOC-chunk ids, index-chunk ids, and every entry's chunk
    /// ids. The sweep walks the on-disk fanout tree rather than the index,
    /// which also reclaims orphans left by aborted writes and superseded
    /// snapshots.
    fn gc_blocks(&mut self) -> Result<()> {
        let mut reachable: HashSet<BlockId> = HashSet::new();
        for head in fs::read_dir(self.cask.root.join("heads"))? {
            let head = head?;
            if !head.file_type()?.is_file() {
                continue;
            }
            let state = unmarshal_head(&head.path(), &self.cask.access, &self.header)?;
            reachable.extend(state.toc_set.blocks.iter().copied());
            reachable.extend(state.index_set.blocks.iter().copied());
            for entry in state.toc.paths.values() {
                reachable.extend(entry.blocks.blocks.iter().copied());
            }
        }

        let stale: Vec<BlockId> = self
            .index
            .iter()
            .map(|info| info.id)
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &stale {
            self.index.remove(id);
        }

        let store = self.cask.access.store();
        let dead: Vec<BlockId> = store
            .ids()?
            .into_iter()
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &dead {
            store.remove(id)?;
        }
        for id in &dead {
            store.remove_fan_if_empty(id)?;
        }

        if !dead.is_empty() {
            debug!(removed = dead.len(), "garbage collected unreachable blocks");
        }
        Ok(())
    }

    /// Rewrites `blocks.idx` and publishes the reconciled index.
    fn flush_block_toc(&mut self) -> Result<()> {
        self.index.save(self.cask.root.join("blocks.idx"))?;
        *self.cask.index.write().unwrap() = self.index.clone();
        *self.cask.toc_set.lock().unwrap() = self.toc_set.clone();
        *self.cask.index_set.lock().unwrap() = self.index_set.clone();
        Ok(())
    }
}

#[cfg(unix)]
fn capture_metadata(entry: &mut Entry, meta: &fs::Metadata) {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use crate::toc::{TimeSpec, SETGID, SETUID};

    let mode = meta.permissions().mode();
    entry.perm = mode & 0o777;
    entry.flags = mode & (SETUID | SETGID);

    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(meta.uid())) {
        entry.uname = user.name;
    }
    if let Ok(Some(group)) = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(meta.gid()))
    {
        entry.gname = group.name;
    }

    entry.created_at = Some(TimeSpec {
        seconds: meta.ctime(),
        nanos: meta.ctime_nsec() as i32,
    });
    entry.modified_at = Some(TimeSpec {
        seconds: meta.mtime(),
        nanos: meta.mtime_nsec() as i32,
    });
}

#[cfg(not(unix))]
fn capture_metadata(entry: &mut Entry, meta: &fs::Metadata) {
    use crate::toc::TimeSpec;
    use std::time::UNIX_EPOCH;

    if let Ok(modified) = meta.modified() {
        if let Ok(since) = modified.duration_since(UNIX_EPOCH) {
            entry.modified_at = Some(TimeSpec {
                seconds: since.as_secs() as i64,
                nanos: since.subsec_nanos() as i32,
            });
        }
    }
}
