//! In-memory backend, used by tests and ephemeral engines.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, StorageInput, StorageOutput};

#[derive(Debug, Clone, Default)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

type Buffer = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Buffer>>,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
        }
    }

    fn buffer(&self, name: &str) -> Result<Buffer> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TesseraError::not_found(format!("file [{name}]")))
    }
}

impl Storage for MemoryStorage {
    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let snapshot = self.buffer(name)?.lock().clone();
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(snapshot),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let buffer: Buffer = Arc::default();
        self.files.write().insert(name.to_string(), buffer.clone());
        Ok(Box::new(MemoryOutput { buffer }))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let buffer = self
            .files
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MemoryOutput { buffer }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let mut files = self.files.write();
        let buffer = files
            .remove(old)
            .ok_or_else(|| TesseraError::not_found(format!("file [{old}]")))?;
        files.insert(new.to_string(), buffer);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.buffer(name)?.lock().len() as u64)
    }
}

#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

#[derive(Debug)]
struct MemoryOutput {
    buffer: Buffer,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }
}
