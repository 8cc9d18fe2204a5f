//! Append-only log of blocks not yet cemented.
//!
//! Two instances are live at any time: `RO`, frozen at the last merge,
//! and `RW`, accumulating new blocks. Each instance is a directory with
//! one `blocks` data file of length-prefixed records; the hash index is
//! rebuilt by scanning the file on open. Records carry, next to the
//! block itself, the hashes of ancestors at power-of-two distances so
//! reverse walks skip most of the chain.

use std::{
    collections::HashMap,
    fs,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

use parity_scale_codec::{Decode, Encode};
use parking_lot::{Mutex, RwLock};
use tessera_data_model::{Block, BlockHash};
use tessera_logger::prelude::*;

use crate::error::{AddErrContextExt as _, Error, Result};

const BLOCKS_FILE_NAME: &str = "blocks";

/// Role of a floating instance; doubles as its directory name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatingKind {
    /// Frozen since the last merge.
    RO,
    /// Accumulating new blocks.
    RW,
    /// Rewrite target while a merge is running.
    RoTmp,
    /// Staging area while a merge swaps instances.
    RwTmp,
}

impl FloatingKind {
    /// Directory name of this instance.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            FloatingKind::RO => "RO",
            FloatingKind::RW => "RW",
            FloatingKind::RoTmp => "RO_TMP",
            FloatingKind::RwTmp => "RW_TMP",
        }
    }
}

/// One record of the data file.
#[derive(Clone, Debug, Encode, Decode)]
struct FloatingRecord {
    block: Block,
    predecessors: Vec<BlockHash>,
}

#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    level: i32,
    predecessors: Vec<BlockHash>,
}

/// One floating store instance.
///
/// The merge swap renames instance directories while they are shared;
/// all I/O goes through the open descriptor, which renames do not
/// disturb, and the recorded identity is updated alongside.
#[derive(Debug)]
pub struct FloatingStore {
    ident: RwLock<(FloatingKind, PathBuf)>,
    file: Mutex<fs::File>,
    index: RwLock<HashMap<BlockHash, IndexEntry>>,
    order: RwLock<Vec<BlockHash>>,
}

impl FloatingStore {
    /// Open (or create) the `kind` instance under `base_dir`,
    /// rebuilding the in-memory index by scanning the data file.
    pub fn open(base_dir: &Path, kind: FloatingKind) -> Result<Self> {
        let dir = base_dir.join(kind.dir_name());
        fs::create_dir_all(&dir).add_err_context(&dir)?;
        let path = dir.join(BLOCKS_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .add_err_context(&path)?;

        let mut index = HashMap::new();
        let mut order = Vec::new();
        let len = file.metadata().add_err_context(&path)?.len();
        let mut cursor = 0_u64;
        file.seek(SeekFrom::Start(0)).add_err_context(&path)?;
        while cursor < len {
            match read_record(&mut file, &path, cursor, len) {
                Ok(Some((record, next))) => {
                    let hash = record.block.hash;
                    index.insert(
                        hash,
                        IndexEntry {
                            offset: cursor,
                            level: record.block.level(),
                            predecessors: record.predecessors,
                        },
                    );
                    order.push(hash);
                    cursor = next;
                }
                Ok(None) | Err(_) => {
                    // Torn tail from a crash: truncate to the last
                    // complete record.
                    warn!(
                        kind = kind.dir_name(),
                        offset = cursor,
                        "truncating torn floating-store tail"
                    );
                    file.set_len(cursor).add_err_context(&path)?;
                    break;
                }
            }
        }

        Ok(Self {
            ident: RwLock::new((kind, dir)),
            file: Mutex::new(file),
            index: RwLock::new(index),
            order: RwLock::new(order),
        })
    }

    /// Role of this instance.
    #[must_use]
    pub fn kind(&self) -> FloatingKind {
        self.ident.read().0
    }

    /// Directory of this instance.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.ident.read().1.clone()
    }

    /// Whether `hash` is stored here.
    #[must_use]
    pub fn mem(&self, hash: &BlockHash) -> bool {
        self.index.read().contains_key(hash)
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    /// Level of a stored block.
    #[must_use]
    pub fn level_of(&self, hash: &BlockHash) -> Option<i32> {
        self.index.read().get(hash).map(|entry| entry.level)
    }

    /// Stored hashes in insertion order.
    #[must_use]
    pub fn hashes(&self) -> Vec<BlockHash> {
        self.order.read().clone()
    }

    /// Stored predecessor list of a block.
    #[must_use]
    pub fn predecessors(&self, hash: &BlockHash) -> Option<Vec<BlockHash>> {
        self.index
            .read()
            .get(hash)
            .map(|entry| entry.predecessors.clone())
    }

    /// Append a block with its predecessor list.
    pub fn append_block(&self, block: &Block, predecessors: Vec<BlockHash>) -> Result<()> {
        let record = FloatingRecord {
            block: block.clone(),
            predecessors: predecessors.clone(),
        };
        let encoded = record.encode();
        let path = self.dir().join(BLOCKS_FILE_NAME);

        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0)).add_err_context(&path)?;
        let mut framed = Vec::with_capacity(4 + encoded.len());
        framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        framed.extend_from_slice(&encoded);
        file.write_all(&framed).add_err_context(&path)?;
        drop(file);

        self.index.write().insert(
            block.hash,
            IndexEntry {
                offset,
                level: block.level(),
                predecessors,
            },
        );
        self.order.write().push(block.hash);
        Ok(())
    }

    /// Read a block by hash, `None` when absent.
    pub fn read_block_opt(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let offset = match self.index.read().get(hash) {
            Some(entry) => entry.offset,
            None => return Ok(None),
        };
        let path = self.dir().join(BLOCKS_FILE_NAME);
        let mut file = self.file.lock();
        let len = file.metadata().add_err_context(&path)?.len();
        match read_record(&mut file, &path, offset, len)? {
            Some((record, _)) => Ok(Some(record.block)),
            None => Ok(None),
        }
    }

    /// Read a block by hash, failing when absent.
    pub fn read_block(&self, hash: &BlockHash) -> Result<Block> {
        self.read_block_opt(hash)?.ok_or(Error::BlockNotFound {
            hash: *hash,
            distance: 0,
        })
    }

    /// Fold over the stored blocks in insertion order.
    pub fn iter_with_pred(
        &self,
        mut f: impl FnMut(Block, &[BlockHash]) -> Result<()>,
    ) -> Result<()> {
        let order = self.order.read().clone();
        for hash in order {
            let Some(block) = self.read_block_opt(&hash)? else {
                continue;
            };
            let predecessors = self.predecessors(&hash).unwrap_or_default();
            f(block, &predecessors)?;
        }
        Ok(())
    }

    /// Delete this instance's directory.
    pub fn delete(&self) -> Result<()> {
        let dir = self.dir();
        fs::remove_dir_all(&dir).add_err_context(&dir)
    }

    /// Move this instance to the `kind` role under `base_dir`. The
    /// open descriptor survives the rename.
    pub fn rename_to(&self, base_dir: &Path, kind: FloatingKind) -> Result<()> {
        let dst = base_dir.join(kind.dir_name());
        if dst.exists() {
            fs::remove_dir_all(&dst).add_err_context(&dst)?;
        }
        let mut ident = self.ident.write();
        fs::rename(&ident.1, &dst).add_err_context(&dst)?;
        *ident = (kind, dst);
        Ok(())
    }
}

/// Read one record at `offset`; `None` signals a clean end of file,
/// an error a torn record.
fn read_record(
    file: &mut fs::File,
    path: &Path,
    offset: u64,
    file_len: u64,
) -> Result<Option<(FloatingRecord, u64)>> {
    if offset + 4 > file_len {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset)).add_err_context(path)?;
    let mut word = [0_u8; 4];
    file.read_exact(&mut word).add_err_context(path)?;
    let length = u64::from(u32::from_be_bytes(word));
    if offset + 4 + length > file_len {
        return Ok(None);
    }
    let mut payload = vec![0_u8; length as usize];
    file.read_exact(&mut payload).add_err_context(path)?;
    let record = FloatingRecord::decode(&mut payload.as_slice())?;
    Ok(Some((record, offset + 4 + length)))
}

#[cfg(test)]
mod tests {
    use tessera_data_model::test_support::chain_of;

    use super::*;

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
        let blocks = chain_of(5, 12);

        for block in &blocks {
            store.append_block(block, vec![block.header.predecessor]).unwrap();
        }

        assert_eq!(store.count(), 5);
        assert!(store.mem(&blocks[3].hash));
        let read_back = store.read_block(&blocks[3].hash).unwrap();
        assert_eq!(read_back, blocks[3]);
        assert_eq!(
            store.predecessors(&blocks[3].hash),
            Some(vec![blocks[3].header.predecessor])
        );
        assert!(store.read_block_opt(&BlockHash::hash_bytes(b"nope")).unwrap().is_none());
    }

    #[test]
    fn index_is_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain_of(8, 12);
        {
            let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
            for block in &blocks {
                store.append_block(block, Vec::new()).unwrap();
            }
        }
        let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
        assert_eq!(store.count(), 8);
        assert_eq!(store.read_block(&blocks[7].hash).unwrap(), blocks[7]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain_of(3, 12);
        {
            let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
            for block in &blocks {
                store.append_block(block, Vec::new()).unwrap();
            }
        }
        // Simulate a crash mid-append.
        let path = dir.path().join("RW").join(BLOCKS_FILE_NAME);
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 42, 1, 2, 3]).unwrap();
        drop(file);

        let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
        assert_eq!(store.count(), 3);
        // The store accepts appends again after truncation.
        let more = chain_of(4, 12);
        store.append_block(&more[3], Vec::new()).unwrap();
        assert_eq!(store.count(), 4);
    }

    #[test]
    fn iteration_is_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FloatingStore::open(dir.path(), FloatingKind::RW).unwrap();
        let blocks = chain_of(6, 12);
        for block in blocks.iter().rev() {
            store.append_block(block, Vec::new()).unwrap();
        }

        let mut seen = Vec::new();
        store
            .iter_with_pred(|block, _| {
                seen.push(block.level());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn rename_swaps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain_of(2, 12);
        let store = FloatingStore::open(dir.path(), FloatingKind::RoTmp).unwrap();
        store.append_block(&blocks[1], Vec::new()).unwrap();

        store.rename_to(dir.path(), FloatingKind::RO).unwrap();
        assert_eq!(store.kind(), FloatingKind::RO);
        assert!(dir.path().join("RO").exists());
        assert!(!dir.path().join("RO_TMP").exists());
        assert!(store.mem(&blocks[1].hash));
    }
}
