//! # cask-fs
//!
//! The transactional layer of the cask object store: a content-addressed,
//! deduplicating, versioned file store.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         cask-fs                          │
//! │  Cask (heads, options, snapshots)                        │
//! │  Txn  (staged updates, commit, reachability GC)          │
//! ├──────────────────────────────────────────────────────────┤
//! │                         cask-cas                         │
//! │  transform pipeline (lz4 → aead) · fanout block store    │
//! │  block index (refcounts)                                 │
//! ├──────────────────────────────────────────────────────────┤
//! │                        cask-chunk                        │
//! │  Rabin content-defined chunker · buffer pools            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Repository layout
//!
//! ```text
//! <root>/
//!   heads/<name>       head files (default: "primary")
//!   blocks.idx         block index
//!   blocks/<xx>/<id>   block files, xx = first 6 hex of the id
//!   .lock              advisory writer lock
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use cask_fs::{Cask, CaskOptions};
//!
//! # fn main() -> cask_fs::Result<()> {
//! let cask = Cask::open("/tmp/repo", CaskOptions::new().with_lz4())?;
//! cask.write_file("notes/today", &b"hello"[..])?;
//!
//! let mut reader = cask.reader_for("notes/today")?;
//! let data = reader.read_all()?;
//! # Ok(())
//! # }
//! ```
//!
//! Paths are opaque strings — `/` has no special meaning. Each write
//! replaces the whole entry; there are no partial-file writes. One process
//! should write to a repository at a time; write transactions additionally
//! take an advisory file lock so concurrent committers fail fast with
//! [`FsError::Locked`].

mod cancel;
mod io;
mod lock;
mod toc;
mod txn;

pub use cancel::CancelToken;
pub use io::{CaskWriter, EntryReader, EntryWriter};
pub use toc::{
    BlockSet, Entry, EntryKind, TimeSpec, Toc, TocHeader, DEFAULT_HEAD, SETGID, SETUID,
};
pub use txn::Txn;

pub use cask_cas::{block_id, BlockId, BlockInfo, CasError, Key, SetDigest};
pub use cask_chunk::{ChunkError, AVG_BLOCK, MAX_BLOCK, MIN_BLOCK};

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::debug;

use cask_cas::{BlockAccess, BlockIndex, PipelineConfig};

use crate::toc::unmarshal_head;

/// Errors from repository operations.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("path not found in table of contents")]
    NotFound,

    #[error("only read operations allowed")]
    ReadOnly,

    #[error("compression setting mismatched")]
    CompressionMismatch,

    #[error("wrong encryption key provided")]
    WrongEncryptionKey,

    #[error("table of contents is corrupt")]
    CorruptToc,

    #[error("corrupt file: block {id} missing from index")]
    CorruptFile { id: String },

    #[error("head header too large: {len} bytes")]
    HeaderOverflow { len: usize },

    #[error("repository is locked by another writer")]
    Locked,

    #[error("operation interrupted")]
    Interrupted,

    #[error("only regular files are supported")]
    UnsupportedFileKind,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("serialization error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Open-time configuration, the builder for [`Cask::open`].
#[derive(Debug, Clone, Default)]
pub struct CaskOptions {
    head: Option<String>,
    lz4: bool,
    encryption: Option<Key>,
    settings_from: Option<PipelineConfig>,
}

impl CaskOptions {
    pub fn new() -> CaskOptions {
        CaskOptions::default()
    }

    /// Selects a head other than [`DEFAULT_HEAD`].
    pub fn with_head(mut self, name: &str) -> CaskOptions {
        self.head = Some(name.to_string());
        self
    }

    /// Enables LZ4 compression on write and read. New head headers record
    /// the setting; reopening without it fails with
    /// [`FsError::CompressionMismatch`].
    pub fn with_lz4(mut self) -> CaskOptions {
        self.lz4 = true;
        self
    }

    /// Enables encryption to `key`'s public half on write and decryption
    /// with its private half on read.
    pub fn with_encryption(mut self, key: Key) -> CaskOptions {
        self.encryption = Some(key);
        self
    }

    /// Shares another repository's transform settings (compression and
    /// encryption key) instead of configuring them anew.
    pub fn with_settings_from(mut self, parent: &Cask) -> CaskOptions {
        self.settings_from = Some(parent.pipeline.clone());
        self
    }
}

/// A handle to one repository head.
///
/// Cheap reads go through [`Cask::reader_for`]; every mutating convenience
/// method opens a write transaction and commits it. For multi-operation
/// atomicity, open a [`Txn`] explicitly.
pub struct Cask {
    pub(crate) root: PathBuf,
    pub(crate) head: String,
    pub(crate) read_only: bool,
    pub(crate) access: Arc<BlockAccess>,
    pub(crate) pipeline: PipelineConfig,
    pub(crate) header: TocHeader,
    pub(crate) toc: Mutex<Toc>,
    pub(crate) toc_set: Mutex<Option<BlockSet>>,
    pub(crate) index_set: Mutex<Option<BlockSet>>,
    pub(crate) index: Arc<RwLock<BlockIndex>>,
    pub(crate) writer_mu: Mutex<()>,
}

impl Cask {
    /// Opens (creating if necessary) the repository at `root`.
    ///
    /// An existing head is validated against the configured options before
    /// any payload is read: a compression mismatch or a wrong encryption key
    /// fails the open.
    pub fn open<P: AsRef<Path>>(root: P, options: CaskOptions) -> Result<Cask> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blocks"))?;
        fs::create_dir_all(root.join("heads"))?;

        let pipeline = match options.settings_from {
            Some(pipeline) => pipeline,
            None => PipelineConfig {
                lz4: options.lz4,
                encryption: options.encryption,
            },
        };
        let access = Arc::new(BlockAccess::new(root.join("blocks"), &pipeline)?);
        let header = TocHeader {
            key_id: pipeline.key_id(),
            compressed: pipeline.compressed(),
            ..Default::default()
        };

        let head = options.head.unwrap_or_else(|| DEFAULT_HEAD.to_string());
        let head_path = root.join("heads").join(&head);
        let (toc, toc_set, index_set, embedded_index) = if head_path.exists() {
            let state = unmarshal_head(&head_path, &access, &header)?;
            (
                state.toc,
                Some(state.toc_set),
                Some(state.index_set),
                Some(state.index),
            )
        } else {
            (Toc::default(), None, None, None)
        };

        // A head without blocks.idx means a crash landed between the head
        // rename and the index rewrite; the head's embedded index snapshot
        // is the best recovery source.
        let index_path = root.join("blocks.idx");
        let index = if index_path.exists() {
            BlockIndex::load(&index_path)?
        } else {
            embedded_index.unwrap_or_default()
        };
        debug!(
            root = %root.display(),
            head = %head,
            paths = toc.paths.len(),
            blocks = index.len(),
            "opened repository"
        );

        Ok(Cask {
            root,
            head,
            read_only: false,
            access,
            pipeline,
            header,
            toc: Mutex::new(toc),
            toc_set: Mutex::new(toc_set),
            index_set: Mutex::new(index_set),
            index: Arc::new(RwLock::new(index)),
            writer_mu: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    /// Returns a copy of the committed entry for `path`, if any.
    pub fn entry(&self, path: &str) -> Option<Entry> {
        self.toc.lock().unwrap().paths.get(path).cloned()
    }

    /// Returns the index record for a block, if the current head tracks it.
    pub fn block_info(&self, id: &BlockId) -> Option<BlockInfo> {
        self.index.read().unwrap().find(id).cloned()
    }

    /// Snapshot of the whole block index.
    pub fn block_infos(&self) -> Vec<BlockInfo> {
        self.index.read().unwrap().iter().cloned().collect()
    }

    pub(crate) fn head_path(&self) -> PathBuf {
        self.root.join("heads").join(&self.head)
    }

    /// Opens a transaction. Write transactions hold the repository's writer
    /// mutex and the advisory lock until committed or dropped.
    pub fn txn(&self, write: bool) -> Result<Txn<'_>> {
        Txn::open(self, write)
    }

    /// Returns a lazy reader over the path's current contents.
    pub fn reader_for(&self, path: &str) -> Result<EntryReader<'_>> {
        let toc = self.toc.lock().unwrap();
        let entry = toc.paths.get(path).ok_or(FsError::NotFound)?;
        Ok(EntryReader::new(&self.access, entry.blocks.blocks.clone()))
    }

    /// Returns a sink for `path` that stages and commits when closed.
    ///
    /// The writer owns a write transaction, so it holds the repository's
    /// write lock until [`CaskWriter::close`].
    pub fn writer_for(&self, path: &str) -> Result<CaskWriter<'_>> {
        let txn = self.txn(true)?;
        let entry = txn
            .entry_for(path)
            .cloned()
            .unwrap_or_else(Entry::new_file);
        Ok(CaskWriter::new(txn, path.to_string(), entry))
    }

    /// Writes `src` as the new contents of `path` and commits.
    pub fn write_file<R: Read>(&self, path: &str, src: R) -> Result<u64> {
        let mut txn = self.txn(true)?;
        let written = txn.write_file(path, src)?;
        txn.commit()?;
        Ok(written)
    }

    /// Stores an on-disk file under `path`, capturing its metadata, and
    /// commits.
    pub fn copy_file(&self, path: &str, file: &fs::File) -> Result<u64> {
        let mut txn = self.txn(true)?;
        let written = txn.copy_file(path, file)?;
        txn.commit()?;
        Ok(written)
    }

    /// Removes `path` and commits.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        let mut txn = self.txn(true)?;
        txn.remove_file(path)?;
        txn.commit()
    }

    /// Snapshots the current state as `heads/<name>` and commits.
    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        let mut txn = self.txn(true)?;
        txn.create_snapshot(name)?;
        txn.commit()
    }

    /// Opens a read-only view of the snapshot named `name`, sharing this
    /// repository's transform settings and block storage.
    pub fn read_snapshot(&self, name: &str) -> Result<Cask> {
        let head_path = self.root.join("heads").join(name);
        if !head_path.exists() {
            return Err(FsError::NotFound);
        }
        let state = unmarshal_head(&head_path, &self.access, &self.header)?;

        Ok(Cask {
            root: self.root.clone(),
            head: name.to_string(),
            read_only: true,
            access: Arc::clone(&self.access),
            pipeline: self.pipeline.clone(),
            header: self.header.clone(),
            toc: Mutex::new(state.toc),
            toc_set: Mutex::new(Some(state.toc_set)),
            index_set: Mutex::new(Some(state.index_set)),
            index: Arc::clone(&self.index),
            writer_mu: Mutex::new(()),
        })
    }
}
