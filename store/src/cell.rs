//! Named persistent data cells.
//!
//! Each chain-level pointer (`current_head`, `checkpoint`, …) lives in
//! its own file holding one SCALE-encoded value. Updates go through a
//! temporary file and an atomic rename so readers never observe a torn
//! value, and a crash leaves either the old or the new value.

use std::{
    fs,
    io::Write as _,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use parity_scale_codec::{Decode, Encode};

use crate::error::{AddErrContextExt as _, Result};

/// A single named on-disk value of type `T`.
#[derive(Debug)]
pub struct DataCell<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Encode + Decode> DataCell<T> {
    /// Bind a cell to `<dir>/<name>`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            _marker: PhantomData,
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cell; `None` when it was never written.
    pub fn load(&self) -> Result<Option<T>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(T::decode(&mut bytes.as_slice())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).add_err_context(&self.path),
        }
    }

    /// Write the cell atomically.
    pub fn store(&self, value: &T) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).add_err_context(&tmp)?;
            file.write_all(&value.encode()).add_err_context(&tmp)?;
            file.sync_data().add_err_context(&tmp)?;
        }
        fs::rename(&tmp, &self.path).add_err_context(&self.path)
    }

    /// Remove the cell, if present.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).add_err_context(&self.path),
        }
    }

    /// Store `Some`, clear on `None`.
    pub fn store_opt(&self, value: Option<&T>) -> Result<()> {
        match value {
            Some(value) => self.store(value),
            None => self.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_data_model::BlockDescriptor;
    use tessera_data_model::BlockHash;

    use super::*;

    #[test]
    fn load_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cell: DataCell<BlockDescriptor> = DataCell::new(dir.path(), "checkpoint");

        assert!(cell.load().unwrap().is_none());

        let value = BlockDescriptor::new(BlockHash::hash_bytes(b"cp"), 42);
        cell.store(&value).unwrap();
        assert_eq!(cell.load().unwrap(), Some(value));

        cell.clear().unwrap();
        assert!(cell.load().unwrap().is_none());
    }

    #[test]
    fn store_replaces_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let cell: DataCell<i32> = DataCell::new(dir.path(), "watermark");
        cell.store(&1).unwrap();
        cell.store(&2).unwrap();
        assert_eq!(cell.load().unwrap(), Some(2));
        // No stray temporary file is left behind.
        assert!(!dir.path().join("watermark.tmp").exists());
    }
}
