//! Byte-oriented persistence backends.
//!
//! Everything the ingestion core persists itself (WAL files, redo logs, index
//! metadata) goes through the [`Storage`] trait. Names are `/`-separated
//! relative paths; backends create intermediate directories as needed.

pub mod file;
pub mod memory;

use std::fmt::Debug;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::Result;

use self::file::{FileStorage, FileStorageConfig};
use self::memory::{MemoryStorage, MemoryStorageConfig};

/// Readable, seekable handle to a stored file.
pub trait StorageInput: Read + Seek + Send + Debug {
    /// Total length of the file in bytes.
    fn size(&self) -> Result<u64>;
}

/// Writable handle to a stored file.
pub trait StorageOutput: Write + Send + Debug {
    /// Flush buffered bytes and make them durable.
    fn flush_and_sync(&mut self) -> Result<()>;
}

/// A flat namespace of named byte files.
pub trait Storage: Send + Sync + Debug {
    fn file_exists(&self, name: &str) -> bool;

    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) a file for writing.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Open a file for appending, creating it if missing.
    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    fn delete_file(&self, name: &str) -> Result<()>;

    /// Move `old` to `new`, replacing it. Atomic on the file backend.
    fn rename_file(&self, old: &str, new: &str) -> Result<()>;

    /// All file names, recursively.
    fn list_files(&self) -> Result<Vec<String>>;

    fn file_size(&self, name: &str) -> Result<u64>;
}

/// Backend selection.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    File(FileStorageConfig),
    Memory(MemoryStorageConfig),
}

pub struct StorageFactory;

impl StorageFactory {
    /// Build a storage backend, creating its root if needed.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::File(config) => Ok(Arc::new(FileStorage::new(config)?)),
            StorageConfig::Memory(config) => Ok(Arc::new(MemoryStorage::new(config))),
        }
    }
}

/// Write `bytes` to `name` through a temporary file and rename it into place.
pub fn write_atomic(storage: &dyn Storage, name: &str, bytes: &[u8], sync: bool) -> Result<()> {
    let tmp = format!("{name}.tmp");
    {
        let mut output = storage.create_output(&tmp)?;
        output.write_all(bytes)?;
        if sync {
            output.flush_and_sync()?;
        } else {
            output.flush()?;
        }
    }
    storage.rename_file(&tmp, name)
}

/// Read the whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buf = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Delete every file whose name starts with `prefix`.
pub fn delete_prefix(storage: &dyn Storage, prefix: &str) -> Result<usize> {
    let mut deleted = 0;
    for name in storage.list_files()? {
        if name.starts_with(prefix) {
            storage.delete_file(&name)?;
            deleted += 1;
        }
    }
    Ok(deleted)
}
