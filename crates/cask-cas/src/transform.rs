//! The per-block transform pipeline.
//!
//! Two optional transforms compose in a fixed order: compression then
//! encryption on write, decryption then decompression on read. The same
//! pipeline is applied to chunk payloads and to serialized table-of-contents
//! payloads.

use std::borrow::Cow;
use std::path::Path;

use tracing::{debug, instrument};

use crate::compress::{Lz4Reader, Lz4Writer};
use crate::crypto::{CryptReader, CryptWriter, Key};
use crate::store::BlockStore;
use crate::{block_id, id_to_hex, BlockId, CasError, Result};

/// A single transform stage. Implementations must be safe to share across
/// threads; any per-call state lives behind interior mutability.
pub trait BlockTransform: Send + Sync {
    fn transform(&self, src: &[u8]) -> Result<Vec<u8>>;
}

/// Declarative pipeline configuration, shareable between repositories.
///
/// Holding the configuration rather than built transform instances lets a
/// child repository rebuild its own pipeline (fresh nonce counters and
/// caches) from a parent's settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub lz4: bool,
    pub encryption: Option<Key>,
}

impl PipelineConfig {
    /// Identity of the configured recipient key; empty when unencrypted.
    pub fn key_id(&self) -> Vec<u8> {
        self.encryption
            .as_ref()
            .map(|k| k.key_id().to_vec())
            .unwrap_or_default()
    }

    pub fn compressed(&self) -> bool {
        self.lz4
    }
}

/// Block access pipeline: fanout store plus the configured transforms.
pub struct BlockAccess {
    store: BlockStore,
    write_compression: Option<Box<dyn BlockTransform>>,
    write_encryption: Option<Box<dyn BlockTransform>>,
    read_compression: Option<Box<dyn BlockTransform>>,
    read_encryption: Option<Box<dyn BlockTransform>>,
}

impl BlockAccess {
    /// Builds a pipeline over `blocks_root` from `config`.
    pub fn new<P: AsRef<Path>>(blocks_root: P, config: &PipelineConfig) -> Result<Self> {
        let mut access = BlockAccess {
            store: BlockStore::new(blocks_root)?,
            write_compression: None,
            write_encryption: None,
            read_compression: None,
            read_encryption: None,
        };
        if config.lz4 {
            access.write_compression = Some(Box::new(Lz4Writer));
            access.read_compression = Some(Box::new(Lz4Reader));
        }
        if let Some(key) = &config.encryption {
            access.write_encryption = Some(Box::new(CryptWriter::new(key)));
            access.read_encryption = Some(Box::new(CryptReader::new(key.clone())));
        }
        Ok(access)
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Applies the write-side transforms: compress, then encrypt.
    pub fn write_transform<'a>(&self, src: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let mut data = Cow::Borrowed(src);
        if let Some(compression) = &self.write_compression {
            data = Cow::Owned(compression.transform(&data)?);
        }
        if let Some(encryption) = &self.write_encryption {
            data = Cow::Owned(encryption.transform(&data)?);
        }
        Ok(data)
    }

    /// Applies the read-side transforms: decrypt, then decompress.
    pub fn read_transform<'a>(&self, src: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let mut data = Cow::Borrowed(src);
        if let Some(encryption) = &self.read_encryption {
            data = Cow::Owned(encryption.transform(&data)?);
        }
        if let Some(compression) = &self.read_compression {
            data = Cow::Owned(compression.transform(&data)?);
        }
        Ok(data)
    }

    /// Transforms and stores a block, returning the stored (post-transform)
    /// byte length.
    #[instrument(skip_all, level = "debug", fields(id = %id_to_hex(id)))]
    pub fn write_block(&self, id: &BlockId, plaintext: &[u8]) -> Result<u64> {
        let stored = self.write_transform(plaintext)?;
        self.store.write(id, &stored)
    }

    /// Reads a block, inverts the transforms, and verifies the plaintext
    /// digests back to `id`.
    #[instrument(skip_all, level = "debug", fields(id = %id_to_hex(id)))]
    pub fn read_block(&self, id: &BlockId) -> Result<Vec<u8>> {
        let raw = self.store.read(id)?;
        let plaintext = self.read_transform(&raw)?.into_owned();
        if block_id(&plaintext) != *id {
            debug!(id = %id_to_hex(id), "block digest mismatch");
            return Err(CasError::CorruptBlock {
                id: id_to_hex(id),
            });
        }
        Ok(plaintext)
    }

    /// Reads and concatenates the plaintext of an ordered block list.
    pub fn read_set(&self, ids: &[BlockId]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for id in ids {
            out.extend_from_slice(&self.read_block(id)?);
        }
        Ok(out)
    }
}
