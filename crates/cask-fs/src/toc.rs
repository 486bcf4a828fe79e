//! Table-of-contents records and the head file format.
//!
//! A head file binds a name to one complete TOC state:
//!
//! ```text
//! offset 0        1 byte    hlen
//! offset 1        hlen      serialized TocHeader
//! offset hlen+1   padding   zeros up to offset 256
//! offset 256      toc_size     transformed serialized BlockSet of the TOC
//! offset 256+...  blocks_size  transformed serialized BlockSet of the index
//! ```
//!
//! The serialized TOC and the serialized block index both grow without
//! bound, so neither is embedded directly: each is chunked and stored
//! through the content-addressed block path like any file, and the head
//! carries only the two (transformed) BlockSets that locate those chunks.
//! A BlockSet stays small no matter how large the state it describes, which
//! keeps the head payloads within a single compression frame. The TOC
//! BlockSet is additionally bound by a digest (`TocHeader::sum`).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use cask_cas::{block_id, BlockAccess, BlockId, BlockIndex};

use crate::{FsError, Result};

/// Name of the head a repository opens by default.
pub const DEFAULT_HEAD: &str = "primary";

/// Bytes reserved for the length-prefixed header at the top of a head file.
pub const HEADER_AREA: usize = 256;
/// Maximum serialized header size (one length byte plus padding reserve).
pub const MAX_HEADER: usize = 247;

/// Setuid permission flag captured from source files.
pub const SETUID: u32 = 0o4000;
/// Setgid permission flag captured from source files.
pub const SETGID: u32 = 0o2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Link,
    Tombstone,
}

/// Seconds/nanoseconds timestamp captured from file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub seconds: i64,
    pub nanos: i32,
}

/// Ordered chunk list for one file plus its digest-of-digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSet {
    pub blocks: Vec<BlockId>,
    pub sum: BlockId,
    pub byte_size: u64,
}

/// One path's record in the TOC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub byte_size: u64,
    pub perm: u32,
    pub flags: u32,
    pub uname: String,
    pub gname: String,
    pub created_at: Option<TimeSpec>,
    pub modified_at: Option<TimeSpec>,
    /// Digest-of-digests of the chunk list; a content hash for the whole
    /// file without re-reading its data.
    pub hash: BlockId,
    pub blocks: BlockSet,
}

impl Entry {
    pub fn new_file() -> Entry {
        Entry {
            kind: EntryKind::File,
            byte_size: 0,
            perm: 0,
            flags: 0,
            uname: String::new(),
            gname: String::new(),
            created_at: None,
            modified_at: None,
            hash: [0u8; 32],
            blocks: BlockSet::default(),
        }
    }
}

/// Path → entry mapping for one head.
///
/// A `BTreeMap` keeps serialization deterministic: identical states always
/// marshal to identical bytes. Paths are opaque strings; a `/` has no
/// special meaning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Toc {
    pub paths: BTreeMap<String, Entry>,
}

/// Fixed prefix of a head file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocHeader {
    /// Identity of the recipient encryption key; empty when unencrypted.
    pub key_id: Vec<u8>,
    pub compressed: bool,
    /// Digest of the transformed TOC BlockSet payload that follows the
    /// header.
    pub sum: Vec<u8>,
    pub toc_size: i64,
    pub blocks_size: i64,
}

/// Assembles head file bytes from a finished header and payloads.
pub(crate) fn encode_head(
    header: &TocHeader,
    p_toc: &[u8],
    p_blocks: &[u8],
) -> Result<Vec<u8>> {
    let header_bytes = bincode::serialize(header)?;
    if header_bytes.len() > MAX_HEADER {
        return Err(FsError::HeaderOverflow {
            len: header_bytes.len(),
        });
    }

    let mut out = Vec::with_capacity(HEADER_AREA + p_toc.len() + p_blocks.len());
    out.push(header_bytes.len() as u8);
    out.extend_from_slice(&header_bytes);
    out.resize(HEADER_AREA, 0);
    out.extend_from_slice(p_toc);
    out.extend_from_slice(p_blocks);
    Ok(out)
}

/// Writes head bytes to `heads/<name>` via a temp file outside `heads/`
/// (so a reachability scan never sees it) and an atomic rename.
pub(crate) fn write_head(root: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = root.join(format!(".{name}.head.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    let dst = root.join("heads").join(name);
    if let Err(e) = fs::rename(&tmp, &dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Decoded contents of one head file.
pub(crate) struct HeadState {
    pub(crate) toc: Toc,
    /// BlockSet locating the TOC's own stored chunks.
    pub(crate) toc_set: BlockSet,
    /// BlockSet locating the block index's stored chunks.
    pub(crate) index_set: BlockSet,
    /// The index as of this head's flush; a recovery snapshot when
    /// `blocks.idx` is missing.
    pub(crate) index: BlockIndex,
}

/// Reads and validates a head file.
///
/// `want` carries the caller's configured `compressed` flag and `key_id`;
/// both are checked against the on-disk header before any payload is read.
pub(crate) fn unmarshal_head(
    path: &Path,
    access: &BlockAccess,
    want: &TocHeader,
) -> Result<HeadState> {
    let data = fs::read(path)?;
    if data.len() < HEADER_AREA {
        return Err(FsError::CorruptToc);
    }

    let hlen = data[0] as usize;
    if hlen == 0 || hlen > MAX_HEADER {
        return Err(FsError::CorruptToc);
    }
    let header: TocHeader =
        bincode::deserialize(&data[1..1 + hlen]).map_err(|_| FsError::CorruptToc)?;

    if header.compressed != want.compressed {
        return Err(FsError::CompressionMismatch);
    }
    if header.key_id != want.key_id {
        return Err(FsError::WrongEncryptionKey);
    }

    let toc_size = header.toc_size as usize;
    let blocks_size = header.blocks_size as usize;
    if data.len() < HEADER_AREA + toc_size + blocks_size {
        return Err(FsError::CorruptToc);
    }

    let p_toc = &data[HEADER_AREA..HEADER_AREA + toc_size];
    if header.sum != block_id(p_toc) {
        return Err(FsError::CorruptToc);
    }

    let toc_set: BlockSet = bincode::deserialize(&access.read_transform(p_toc)?)?;
    let toc_bytes = access.read_set(&toc_set.blocks)?;
    let toc: Toc = bincode::deserialize(&toc_bytes)?;

    let p_blocks = &data[HEADER_AREA + toc_size..HEADER_AREA + toc_size + blocks_size];
    let index_set: BlockSet = bincode::deserialize(&access.read_transform(p_blocks)?)?;
    let index_bytes = access.read_set(&index_set.blocks)?;
    let index: BlockIndex = bincode::deserialize(&index_bytes)?;

    Ok(HeadState {
        toc,
        toc_set,
        index_set,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_inside_the_reserved_area() {
        let header = TocHeader {
            key_id: vec![0xaa; 32],
            compressed: true,
            sum: vec![0xbb; 32],
            toc_size: i64::MAX,
            blocks_size: i64::MAX,
        };
        let bytes = bincode::serialize(&header).unwrap();
        assert!(bytes.len() <= MAX_HEADER);
    }

    #[test]
    fn encode_head_pads_header_area() {
        let header = TocHeader::default();
        let bytes = encode_head(&header, b"toc-payload", b"blocks-payload").unwrap();

        let hlen = bytes[0] as usize;
        assert!(hlen <= MAX_HEADER);
        assert!(bytes[1 + hlen..HEADER_AREA].iter().all(|&b| b == 0));
        assert_eq!(&bytes[HEADER_AREA..HEADER_AREA + 11], b"toc-payload");
        assert_eq!(&bytes[HEADER_AREA + 11..], b"blocks-payload");
    }

    #[test]
    fn oversized_header_is_rejected() {
        let header = TocHeader {
            key_id: vec![0; MAX_HEADER],
            ..Default::default()
        };
        assert!(matches!(
            encode_head(&header, b"", b""),
            Err(FsError::HeaderOverflow { .. })
        ));
    }

    #[test]
    fn toc_serialization_is_deterministic() {
        let mut toc = Toc::default();
        toc.paths.insert("zebra".into(), Entry::new_file());
        toc.paths.insert("apple".into(), Entry::new_file());

        let mut again = Toc::default();
        again.paths.insert("apple".into(), Entry::new_file());
        again.paths.insert("zebra".into(), Entry::new_file());

        assert_eq!(
            bincode::serialize(&toc).unwrap(),
            bincode::serialize(&again).unwrap()
        );
    }
}
