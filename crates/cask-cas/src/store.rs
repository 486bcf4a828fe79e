//! On-disk block layout and raw file access.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{hex_to_id, id_to_hex, BlockId, CasError, Result};

/// Writes `data` to `path` via a sibling temp file and atomic rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(CasError::Io(e));
    }
    Ok(())
}

/// Raw key→bytes map on disk under a 6-hex fanout.
///
/// The fanout keeps any single directory from growing unboundedly. Stored
/// bytes are whatever the transform pipeline produced; this layer knows
/// nothing about compression or encryption.
#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    /// Opens (creating if needed) a block store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(BlockStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fan_dir(&self, hex: &str) -> PathBuf {
        self.root.join(&hex[..6])
    }

    /// Path a block with this id is stored at.
    pub fn block_path(&self, id: &BlockId) -> PathBuf {
        let hex = id_to_hex(id);
        self.fan_dir(&hex).join(&hex)
    }

    /// Writes stored (post-transform) bytes for `id`, creating the fanout
    /// directory on demand. Returns the stored byte length.
    pub fn write(&self, id: &BlockId, data: &[u8]) -> Result<u64> {
        let hex = id_to_hex(id);
        let dir = self.fan_dir(&hex);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(&hex), data)?;
        Ok(data.len() as u64)
    }

    /// Reads the stored bytes for `id`.
    pub fn read(&self, id: &BlockId) -> Result<Vec<u8>> {
        let mut file = File::open(self.block_path(id))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Unlinks the block file for `id`.
    pub fn remove(&self, id: &BlockId) -> Result<()> {
        fs::remove_file(self.block_path(id))?;
        Ok(())
    }

    /// Lists every block id materialized on disk by walking the fanout
    /// tree. Files whose names do not parse as digests (stray temp files)
    /// are skipped.
    pub fn ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for fan in fs::read_dir(&self.root)? {
            let fan = fan?;
            if !fan.file_type()?.is_dir() {
                continue;
            }
            for block in fs::read_dir(fan.path())? {
                let block = block?;
                if !block.file_type()?.is_file() {
                    continue;
                }
                if let Some(name) = block.file_name().to_str() {
                    if let Some(id) = hex_to_id(name) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Removes `id`'s fanout directory if it is now empty.
    pub fn remove_fan_if_empty(&self, id: &BlockId) -> Result<()> {
        let hex = id_to_hex(id);
        let dir = self.fan_dir(&hex);
        match fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    debug!(dir = %dir.display(), "removing empty fanout directory");
                    fs::remove_dir(&dir)?;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CasError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_id;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        let id = block_id(b"payload");
        let stored = store.write(&id, b"payload").unwrap();
        assert_eq!(stored, 7);
        assert_eq!(store.read(&id).unwrap(), b"payload");
    }

    #[test]
    fn block_path_uses_six_hex_fanout() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        let id = block_id(b"x");
        let hex = id_to_hex(&id);
        let path = store.block_path(&id);
        assert!(path.ends_with(Path::new(&hex[..6]).join(&hex)));
    }

    #[test]
    fn ids_walks_the_fanout_and_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        let a = block_id(b"a");
        let b = block_id(b"b");
        store.write(&a, b"a").unwrap();
        store.write(&b, b"b").unwrap();
        std::fs::write(dir.path().join(&id_to_hex(&a)[..6]).join("stray.tmp"), b"x").unwrap();

        let mut ids = store.ids().unwrap();
        ids.sort_unstable();
        let mut want = vec![a, b];
        want.sort_unstable();
        assert_eq!(ids, want);
    }

    #[test]
    fn remove_and_fan_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        let id = block_id(b"gone");
        store.write(&id, b"gone").unwrap();
        store.remove(&id).unwrap();
        store.remove_fan_if_empty(&id).unwrap();

        let hex = id_to_hex(&id);
        assert!(!dir.path().join(&hex[..6]).exists());
    }
}
