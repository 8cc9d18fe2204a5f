//! Immutable archive of cemented cycles.
//!
//! Each cycle file `<S>_<E>` holds the blocks of levels `S..=E`: an
//! offset table of `N` big-endian `u32` slots at the head of the file,
//! then `N` length-prefixed SCALE-encoded blocks. The table makes the
//! look-up by level a pair of seeks. Blocks inside a cycle file never
//! carry metadata; metadata lives in a parallel archive under
//! `metadata/`, one DEFLATE-compressed entry per level, indexed the
//! same way. Two persistent indexes map hashes to levels and back.

use std::{
    fs,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use parity_scale_codec::{Decode, Encode};
use parking_lot::{Mutex, RwLock};
use tessera_data_model::{Block, BlockHash, BlockMetadata, HistoryMode};
use tessera_logger::prelude::*;

use crate::{
    error::{AddErrContextExt as _, CannotCement, CementedIssue, Error, Result},
    index::IndexLog,
};

const METADATA_DIR_NAME: &str = "metadata";
const LEVEL_INDEX_DIR_NAME: &str = "level_index";
const HASH_INDEX_DIR_NAME: &str = "hash_index";

/// One cemented cycle on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CementedRange {
    /// First level in the file.
    pub start_level: i32,
    /// Last level in the file (inclusive).
    pub end_level: i32,
    /// Path of the cycle file.
    pub file: PathBuf,
}

impl CementedRange {
    fn len(&self) -> i32 {
        self.end_level - self.start_level + 1
    }

    fn contains(&self, level: i32) -> bool {
        self.start_level <= level && level <= self.end_level
    }

    fn name(&self) -> String {
        format!("{}_{}", self.start_level, self.end_level)
    }
}

/// The cemented tier of the block store.
///
/// Single-writer: only the merge writes; concurrent reads are safe.
#[derive(Debug)]
pub struct CementedStore {
    dir: PathBuf,
    metadata_dir: PathBuf,
    ranges: RwLock<Vec<CementedRange>>,
    /// `BlockHash → level`.
    level_index: Mutex<IndexLog<BlockHash, i32>>,
    /// `level → BlockHash`.
    hash_index: Mutex<IndexLog<i32, BlockHash>>,
    check_consistency: bool,
}

impl CementedStore {
    /// Open (or create) the cemented store under `dir`.
    pub fn open(dir: &Path, index_write_buffer: usize, check_consistency: bool) -> Result<Self> {
        fs::create_dir_all(dir).add_err_context(dir)?;
        let metadata_dir = dir.join(METADATA_DIR_NAME);
        fs::create_dir_all(&metadata_dir).add_err_context(&metadata_dir)?;

        let mut ranges = Vec::new();
        for entry in fs::read_dir(dir).add_err_context(dir)? {
            let entry = entry.add_err_context(dir)?;
            if !entry.file_type().add_err_context(dir)?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                // Leftover of an interrupted cementing; the cycle was
                // never committed.
                warn!(file = name, "removing stale temporary cycle file");
                fs::remove_file(entry.path()).add_err_context(&entry.path())?;
                continue;
            }
            if let Some((start_level, end_level)) = parse_cycle_name(name) {
                ranges.push(CementedRange {
                    start_level,
                    end_level,
                    file: entry.path(),
                });
            }
        }
        ranges.sort_by_key(|range| range.start_level);

        let level_index = IndexLog::open(&dir.join(LEVEL_INDEX_DIR_NAME), index_write_buffer)?;
        let hash_index = IndexLog::open(&dir.join(HASH_INDEX_DIR_NAME), index_write_buffer)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata_dir,
            ranges: RwLock::new(ranges),
            level_index: Mutex::new(level_index),
            hash_index: Mutex::new(hash_index),
            check_consistency,
        })
    }

    /// Highest cemented level, `None` on an empty store.
    #[must_use]
    pub fn highest_cemented_level(&self) -> Option<i32> {
        self.ranges.read().last().map(|range| range.end_level)
    }

    /// Lowest cemented level, `None` on an empty store.
    #[must_use]
    pub fn lowest_cemented_level(&self) -> Option<i32> {
        self.ranges.read().first().map(|range| range.start_level)
    }

    /// Snapshot of the cycle ranges, sorted by start level.
    #[must_use]
    pub fn cemented_ranges(&self) -> Vec<CementedRange> {
        self.ranges.read().clone()
    }

    /// Level of a cemented block, by hash.
    #[must_use]
    pub fn get_cemented_block_level(&self, hash: &BlockHash) -> Option<i32> {
        self.level_index.lock().get(hash)
    }

    /// Hash of a cemented block, by level.
    #[must_use]
    pub fn get_cemented_block_hash(&self, level: i32) -> Option<BlockHash> {
        self.hash_index.lock().get(&level)
    }

    /// Whether the block is cemented.
    #[must_use]
    pub fn is_cemented(&self, hash: &BlockHash) -> bool {
        self.level_index.lock().contains(hash)
    }

    /// Archive a batch of consecutive blocks as one cycle file.
    ///
    /// Refused, before any disk mutation, when the batch is empty, does
    /// not extend the highest cemented cycle, or a temporary file from
    /// a concurrent cementing is present.
    pub fn cement_blocks(&self, blocks: &[Block], write_metadata: bool) -> Result<()> {
        let (first, last) = match (blocks.first(), blocks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::CannotCement(CannotCement::Empty)),
        };
        let start_level = first.level();
        let end_level = last.level();

        if self.check_consistency {
            if let Some(highest) = self.highest_cemented_level() {
                if start_level != highest + 1 {
                    return Err(Error::CannotCement(CannotCement::HigherCemented));
                }
            }
            for (i, block) in blocks.iter().enumerate() {
                if block.level() != start_level + i as i32 {
                    return Err(Error::InconsistentCementedStore(
                        CementedIssue::UnexpectedLevel {
                            got: block.level(),
                            expected: start_level + i as i32,
                        },
                    ));
                }
            }
        }

        let range = CementedRange {
            start_level,
            end_level,
            file: self.dir.join(format!("{start_level}_{end_level}")),
        };
        let tmp = self.dir.join(format!("{}.tmp", range.name()));
        if tmp.exists() {
            return Err(Error::CannotCement(CannotCement::TmpExists));
        }

        let encoded: Vec<Vec<u8>> = blocks
            .iter()
            .map(|block| block.clone().pruned().encode())
            .collect();
        write_offset_table_file(&tmp, &encoded)?;
        fs::rename(&tmp, &range.file).add_err_context(&range.file)?;

        if write_metadata {
            let entries: Vec<Vec<u8>> = blocks
                .iter()
                .map(|block| match &block.metadata {
                    Some(metadata) => deflate(&metadata.encode()),
                    // A block without metadata gets an empty entry.
                    None => Ok(Vec::new()),
                })
                .collect::<Result<_>>()?;
            let metadata_tmp = self.metadata_dir.join(format!("{}.tmp", range.name()));
            let metadata_file = self.metadata_dir.join(range.name());
            write_offset_table_file(&metadata_tmp, &entries)?;
            fs::rename(&metadata_tmp, &metadata_file).add_err_context(&metadata_file)?;
        }

        {
            let mut level_index = self.level_index.lock();
            let mut hash_index = self.hash_index.lock();
            for block in blocks {
                level_index.put(block.hash, block.level())?;
                hash_index.put(block.level(), block.hash)?;
            }
            level_index.commit()?;
            hash_index.commit()?;
        }

        let mut ranges = self.ranges.write();
        ranges.push(range);
        ranges.sort_by_key(|range| range.start_level);
        debug!(start_level, end_level, "cemented cycle");
        Ok(())
    }

    /// Locate the cycle file holding `level`.
    ///
    /// Starts from a pivot assuming regular cycle lengths and falls
    /// back to a dichotomic search when the pivot misses.
    #[must_use]
    pub fn find_block_file(&self, level: i32) -> Option<CementedRange> {
        let ranges = self.ranges.read();
        let first = ranges.first()?;
        let last = ranges.last()?;
        if level < first.start_level || level > last.end_level {
            return None;
        }

        let last_interval = last.len();
        let guess = if last_interval > 0 {
            (1 + (level - 2) / last_interval).clamp(0, ranges.len() as i32 - 1) as usize
        } else {
            0
        };
        if ranges[guess].contains(level) {
            return Some(ranges[guess].clone());
        }

        match ranges.binary_search_by(|range| {
            if range.contains(level) {
                std::cmp::Ordering::Equal
            } else if range.end_level < level {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        }) {
            Ok(found) => Some(ranges[found].clone()),
            Err(_) => None,
        }
    }

    /// Read a cemented block by level.
    pub fn get_cemented_block_by_level(
        &self,
        level: i32,
        read_metadata: bool,
    ) -> Result<Option<Block>> {
        let Some(range) = self.find_block_file(level) else {
            return Ok(None);
        };
        let slot = (level - range.start_level) as u64;
        let bytes = read_offset_table_entry(&range.file, slot)?;
        let mut block = Block::decode(&mut bytes.as_slice())?;
        if read_metadata {
            block.metadata = self.read_cemented_metadata(&range, level)?;
        }
        Ok(Some(block))
    }

    /// Read a cemented block by hash.
    pub fn get_cemented_block_by_hash(
        &self,
        hash: &BlockHash,
        read_metadata: bool,
    ) -> Result<Option<Block>> {
        match self.get_cemented_block_level(hash) {
            Some(level) => self.get_cemented_block_by_level(level, read_metadata),
            None => Ok(None),
        }
    }

    /// Read the metadata of a cemented block, `None` once pruned.
    pub fn read_cemented_metadata(
        &self,
        range: &CementedRange,
        level: i32,
    ) -> Result<Option<BlockMetadata>> {
        let path = self.metadata_dir.join(range.name());
        if !path.exists() {
            return Ok(None);
        }
        let slot = (level - range.start_level) as u64;
        let compressed = read_offset_table_entry(&path, slot)?;
        if compressed.is_empty() {
            return Ok(None);
        }
        let bytes = inflate(&compressed)?;
        Ok(Some(BlockMetadata::decode(&mut bytes.as_slice())?))
    }

    /// Apply the retention policy of `history_mode`.
    ///
    /// Archive keeps everything. Full drops the metadata archives of
    /// all but the retained cycles. Rolling additionally unlinks the
    /// old cycle files and filters both indexes.
    pub fn trigger_gc(&self, history_mode: &HistoryMode) -> Result<()> {
        let Some(retained) = history_mode.retained_cycles() else {
            return Ok(());
        };
        let retained = usize::from(retained.max(1));

        let purge: Vec<CementedRange> = {
            let ranges = self.ranges.read();
            if ranges.len() <= retained {
                return Ok(());
            }
            ranges[..ranges.len() - retained].to_vec()
        };

        for range in &purge {
            let metadata_file = self.metadata_dir.join(range.name());
            match fs::remove_file(&metadata_file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e, metadata_file)),
            }
        }

        if matches!(history_mode, HistoryMode::Rolling { .. }) {
            let last_level_to_purge = purge
                .last()
                .map(|range| range.end_level)
                .expect("INTERNAL BUG: purge set is non-empty past the retention check");
            for range in &purge {
                fs::remove_file(&range.file).add_err_context(&range.file)?;
            }
            self.ranges
                .write()
                .retain(|range| range.start_level > last_level_to_purge);
            self.level_index
                .lock()
                .retain(|_, level| *level > last_level_to_purge)?;
            self.hash_index
                .lock()
                .retain(|level, _| *level > last_level_to_purge)?;
            info!(last_level_to_purge, "rolling gc dropped old cycles");
        }
        Ok(())
    }

    /// Verify range contiguity, offset tables and both indexes.
    pub fn check_indexes_consistency(&self) -> Result<()> {
        let ranges = self.ranges.read().clone();
        for window in ranges.windows(2) {
            if window[1].start_level != window[0].end_level + 1 {
                return Err(Error::InconsistentCementedStore(CementedIssue::MissingCycle(
                    format!("{}_{}", window[0].end_level + 1, window[1].start_level - 1),
                )));
            }
        }

        let level_index = self.level_index.lock();
        let hash_index = self.hash_index.lock();
        for range in &ranges {
            for level in range.start_level..=range.end_level {
                let slot = (level - range.start_level) as u64;
                let bytes = read_offset_table_entry(&range.file, slot)
                    .map_err(|_| Error::InconsistentCementedStore(CementedIssue::BadOffset { level }))?;
                let block = Block::decode(&mut bytes.as_slice())
                    .map_err(|_| Error::InconsistentCementedStore(CementedIssue::BadOffset { level }))?;
                if block.level() != level {
                    return Err(Error::InconsistentCementedStore(CementedIssue::UnexpectedLevel {
                        got: block.level(),
                        expected: level,
                    }));
                }
                if level_index.get(&block.hash) != Some(level)
                    || hash_index.get(&level) != Some(block.hash)
                {
                    return Err(Error::InconsistentCementedStore(CementedIssue::CorruptedIndex(
                        block.hash, level,
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_cycle_name(name: &str) -> Option<(i32, i32)> {
    let (start, end) = name.split_once('_')?;
    let start: i32 = start.parse().ok()?;
    let end: i32 = end.parse().ok()?;
    (start <= end).then_some((start, end))
}

/// Write `entries` to `path` as an offset table followed by the
/// length-prefixed entries. Big-endian throughout.
fn write_offset_table_file(path: &Path, entries: &[Vec<u8>]) -> Result<()> {
    let mut file = fs::File::create(path).add_err_context(path)?;
    let header_len = entries.len() as u32 * 4;

    let mut offsets = Vec::with_capacity(entries.len());
    let mut cursor = u64::from(header_len);
    for entry in entries {
        offsets.push(cursor as u32);
        cursor += 4 + entry.len() as u64;
    }

    let mut contents = Vec::with_capacity(cursor as usize);
    for offset in &offsets {
        contents.extend_from_slice(&offset.to_be_bytes());
    }
    for entry in entries {
        contents.extend_from_slice(&(entry.len() as u32).to_be_bytes());
        contents.extend_from_slice(entry);
    }
    file.write_all(&contents).add_err_context(path)?;
    file.sync_data().add_err_context(path)
}

/// Read the entry at `slot` of an offset-table file: seek to the slot,
/// follow the offset, read the length-prefixed payload.
fn read_offset_table_entry(path: &Path, slot: u64) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path).add_err_context(path)?;
    file.seek(SeekFrom::Start(slot * 4)).add_err_context(path)?;
    let mut word = [0_u8; 4];
    file.read_exact(&mut word).add_err_context(path)?;
    let offset = u32::from_be_bytes(word);

    file.seek(SeekFrom::Start(u64::from(offset)))
        .add_err_context(path)?;
    file.read_exact(&mut word).add_err_context(path)?;
    let length = u32::from_be_bytes(word);

    let mut payload = vec![0_u8; length as usize];
    file.read_exact(&mut payload).add_err_context(path)?;
    Ok(payload)
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .map_err(|e| Error::Io(e, PathBuf::from("<deflate>")))
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Io(e, PathBuf::from("<inflate>")))?;
    Ok(out)
}
