//! Persistent key-value indexes of the cemented store.
//!
//! Each index is an append-only log of fixed-size records under its own
//! directory. The full mapping is reloaded on open; writes accumulate
//! in a bounded buffer and are flushed in one append once the buffer
//! fills (or on an explicit commit). Rewrites, needed by rolling-mode
//! garbage collection, go through a temporary file and a rename.

use std::{
    collections::HashMap,
    fs,
    hash::Hash as StdHash,
    io::{Read as _, Write as _},
    path::{Path, PathBuf},
};

use tessera_data_model::{BlockHash, Hash};

use crate::error::{AddErrContextExt as _, Error, Result};

const LOG_FILE_NAME: &str = "log";

/// Fixed-width binary slot of an index record.
pub trait Slot: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;
    /// Append the encoding of `self`.
    fn write_to(&self, out: &mut Vec<u8>);
    /// Decode from exactly [`Self::WIDTH`] bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

impl Slot for BlockHash {
    const WIDTH: usize = Hash::LENGTH;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut buffer = [0; Hash::LENGTH];
        buffer.copy_from_slice(bytes);
        BlockHash(Hash::prehashed(buffer))
    }
}

impl Slot for i32 {
    const WIDTH: usize = 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut buffer = [0; 4];
        buffer.copy_from_slice(bytes);
        i32::from_be_bytes(buffer)
    }
}

/// An on-disk map from `K` to `V`.
#[derive(Debug)]
pub struct IndexLog<K, V> {
    log_path: PathBuf,
    map: HashMap<K, V>,
    buffered: Vec<(K, V)>,
    buffer_capacity: usize,
}

impl<K, V> IndexLog<K, V>
where
    K: Slot + Eq + StdHash,
    V: Slot,
{
    /// Open (or create) the index under `dir`, reloading the mapping.
    pub fn open(dir: &Path, buffer_capacity: usize) -> Result<Self> {
        fs::create_dir_all(dir).add_err_context(dir)?;
        let log_path = dir.join(LOG_FILE_NAME);
        let mut map = HashMap::new();

        match fs::File::open(&log_path) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents).add_err_context(&log_path)?;
                let record = K::WIDTH + V::WIDTH;
                // A torn tail from a crash is dropped; records are
                // re-appended by the next flush.
                for chunk in contents.chunks_exact(record) {
                    let key = K::read_from(&chunk[..K::WIDTH]);
                    let value = V::read_from(&chunk[K::WIDTH..]);
                    map.insert(key, value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e, log_path)),
        }

        Ok(Self {
            log_path,
            map,
            buffered: Vec::new(),
            buffer_capacity: buffer_capacity.max(1),
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).copied()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert a binding; flushes the buffer when it is full.
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        self.map.insert(key, value);
        self.buffered.push((key, value));
        if self.buffered.len() >= self.buffer_capacity {
            self.commit()?;
        }
        Ok(())
    }

    /// Flush every buffered binding to the log.
    pub fn commit(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(self.buffered.len() * (K::WIDTH + V::WIDTH));
        for (key, value) in self.buffered.drain(..) {
            key.write_to(&mut encoded);
            value.write_to(&mut encoded);
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .add_err_context(&self.log_path)?;
        file.write_all(&encoded).add_err_context(&self.log_path)?;
        file.sync_data().add_err_context(&self.log_path)
    }

    /// Keep only the bindings matching `predicate`, rewriting the log.
    pub fn retain(&mut self, predicate: impl Fn(&K, &V) -> bool) -> Result<()> {
        self.commit()?;
        self.map.retain(|k, v| predicate(k, v));

        let tmp = self.log_path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).add_err_context(&tmp)?;
            let mut encoded = Vec::with_capacity(self.map.len() * (K::WIDTH + V::WIDTH));
            for (key, value) in &self.map {
                key.write_to(&mut encoded);
                value.write_to(&mut encoded);
            }
            file.write_all(&encoded).add_err_context(&tmp)?;
            file.sync_data().add_err_context(&tmp)?;
        }
        fs::rename(&tmp, &self.log_path).add_err_context(&self.log_path)
    }

    /// Iterate over the in-memory mapping.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        BlockHash::hash_bytes([n])
    }

    #[test]
    fn reload_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index: IndexLog<BlockHash, i32> = IndexLog::open(dir.path(), 100).unwrap();
            for level in 0..10 {
                index.put(hash(level as u8), level).unwrap();
            }
            index.commit().unwrap();
        }
        let index: IndexLog<BlockHash, i32> = IndexLog::open(dir.path(), 100).unwrap();
        assert_eq!(index.len(), 10);
        assert_eq!(index.get(&hash(3)), Some(3));
        assert_eq!(index.get(&hash(200)), None);
    }

    #[test]
    fn buffer_flushes_on_capacity() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index: IndexLog<i32, BlockHash> = IndexLog::open(dir.path(), 4).unwrap();
            for level in 0..4 {
                index.put(level, hash(level as u8)).unwrap();
            }
            // Buffer capacity reached: entries are durable without an
            // explicit commit.
        }
        let index: IndexLog<i32, BlockHash> = IndexLog::open(dir.path(), 4).unwrap();
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn retain_drops_purged_levels() {
        let dir = tempfile::tempdir().unwrap();
        let mut index: IndexLog<BlockHash, i32> = IndexLog::open(dir.path(), 100).unwrap();
        for level in 0..20 {
            index.put(hash(level as u8), level).unwrap();
        }
        index.retain(|_, level| *level > 9).unwrap();
        assert_eq!(index.len(), 10);

        let reloaded: IndexLog<BlockHash, i32> = IndexLog::open(dir.path(), 100).unwrap();
        assert_eq!(reloaded.len(), 10);
        assert!(!reloaded.contains(&hash(0)));
        assert!(reloaded.contains(&hash(15)));
    }
}
