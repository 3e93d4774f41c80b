//! Redo log: the consumer's checkpoints next to a WAL.
//!
//! Fixed-size records `[u64 key][u64 len][64-byte "min:max"]`, little-endian.
//! The whole file is rewritten through a temporary file on every checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::storage::{self, Storage};
use crate::wal::SeqId;

const VALUE_LEN: usize = 64;
const RECORD_LEN: usize = 16 + VALUE_LEN;

/// Which checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RedoKey {
    /// Last range dequeued and about to be applied.
    Read = 1,
    /// Last range durably applied.
    Write = 2,
}

impl RedoKey {
    fn from_u64(key: u64) -> Option<Self> {
        match key {
            1 => Some(RedoKey::Read),
            2 => Some(RedoKey::Write),
            _ => None,
        }
    }
}

/// Inclusive range of WAL sequence ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub min_id: SeqId,
    pub max_id: SeqId,
}

impl Checkpoint {
    pub fn new(min_id: SeqId, max_id: SeqId) -> Self {
        Checkpoint { min_id, max_id }
    }
}

#[derive(Debug)]
pub struct RedoLog {
    storage: Arc<dyn Storage>,
    path: String,
    no_sync: bool,
    entries: Mutex<BTreeMap<RedoKey, Checkpoint>>,
}

impl RedoLog {
    pub fn open(storage: Arc<dyn Storage>, path: &str, no_sync: bool) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if storage.file_exists(path) {
            let bytes = storage::read_all(storage.as_ref(), path)?;
            if bytes.len() % RECORD_LEN != 0 {
                return Err(TesseraError::recovery(format!(
                    "redo log [{path}] has a partial record ({} bytes)",
                    bytes.len()
                )));
            }
            for record in bytes.chunks_exact(RECORD_LEN) {
                let key = LittleEndian::read_u64(&record[0..8]);
                let len = LittleEndian::read_u64(&record[8..16]) as usize;
                if len > VALUE_LEN {
                    return Err(TesseraError::recovery(format!(
                        "redo log [{path}] record length {len} out of range"
                    )));
                }
                let value = std::str::from_utf8(&record[16..16 + len]).map_err(|e| {
                    TesseraError::recovery(format!("redo log [{path}] invalid value: {e}"))
                })?;
                let checkpoint = parse_value(value).ok_or_else(|| {
                    TesseraError::recovery(format!("redo log [{path}] invalid value [{value}]"))
                })?;
                if let Some(key) = RedoKey::from_u64(key) {
                    entries.insert(key, checkpoint);
                }
            }
        }

        Ok(RedoLog {
            storage,
            path: path.to_string(),
            no_sync,
            entries: Mutex::new(entries),
        })
    }

    pub fn read_checkpoint(&self, key: RedoKey) -> Option<Checkpoint> {
        self.entries.lock().get(&key).copied()
    }

    /// Persist `key = min:max`. The in-memory value only changes once the
    /// file has been replaced.
    pub fn write_checkpoint(&self, key: RedoKey, min_id: SeqId, max_id: SeqId) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut staged = entries.clone();
        staged.insert(key, Checkpoint::new(min_id, max_id));

        let mut bytes = vec![0u8; staged.len() * RECORD_LEN];
        for (record, (key, checkpoint)) in bytes.chunks_exact_mut(RECORD_LEN).zip(&staged) {
            let value = format!("{}:{}", checkpoint.min_id, checkpoint.max_id);
            LittleEndian::write_u64(&mut record[0..8], *key as u64);
            LittleEndian::write_u64(&mut record[8..16], value.len() as u64);
            record[16..16 + value.len()].copy_from_slice(value.as_bytes());
        }
        storage::write_atomic(self.storage.as_ref(), &self.path, &bytes, !self.no_sync).map_err(
            |e| TesseraError::durability(format!("redo log [{}] write failed: {e}", self.path)),
        )?;

        *entries = staged;
        Ok(())
    }
}

fn parse_value(value: &str) -> Option<Checkpoint> {
    let (min, max) = value.split_once(':')?;
    Some(Checkpoint::new(min.parse().ok()?, max.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_checkpoints_survive_reopen() {
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let redo = RedoLog::open(storage.clone(), "redo.log", false).unwrap();
        assert_eq!(redo.read_checkpoint(RedoKey::Read), None);

        redo.write_checkpoint(RedoKey::Read, 1, 10).unwrap();
        redo.write_checkpoint(RedoKey::Write, 1, 10).unwrap();
        redo.write_checkpoint(RedoKey::Read, 11, 20).unwrap();

        let redo = RedoLog::open(storage.clone(), "redo.log", false).unwrap();
        assert_eq!(redo.read_checkpoint(RedoKey::Read), Some(Checkpoint::new(11, 20)));
        assert_eq!(redo.read_checkpoint(RedoKey::Write), Some(Checkpoint::new(1, 10)));
        assert_eq!(storage.file_size("redo.log").unwrap(), 2 * RECORD_LEN as u64);
    }

    #[test]
    fn test_partial_record_is_recovery_error() {
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        storage::write_atomic(storage.as_ref(), "redo.log", &[1, 2, 3], false).unwrap();
        let err = RedoLog::open(storage, "redo.log", false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Recovery);
    }
}
