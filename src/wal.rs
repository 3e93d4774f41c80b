//! Per-shard write-ahead log.
//!
//! [`WriteAheadLog`] stores pending mutations keyed by a monotonically
//! increasing sequence id. Each append is synced before it returns.
//! [`redo::RedoLog`] sits next to it and records how far the consumer has
//! dequeued and applied.
//!
//! ## File format
//!
//! `[u32: length][u32: crc32][json: WalEntry]` repeated, little-endian. A
//! short or checksum-failing record at the end of the file is an append that
//! never returned and is cut off on open. The same damage anywhere else fails
//! the open.

pub mod redo;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::Source;
use crate::error::{Result, TesseraError};
use crate::storage::{self, Storage, StorageOutput};

/// Sequence id of a WAL entry. The first entry of a fresh log is 1.
pub type SeqId = u64;

const HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// Where an entry should land inside its index shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardTarget {
    /// A concrete sub-shard.
    SubShard(u64),
    /// The newest sub-shard at apply time.
    NeedLatest,
    /// Whichever sub-shard already holds the document, found by point lookup
    /// when the entry is consumed. Falls back to the newest sub-shard.
    NeedUpdate,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Assigned by [`WriteAheadLog::append`].
    #[serde(default)]
    pub seq: SeqId,
    pub action: Action,
    pub doc_id: String,
    pub target: ShardTarget,
    pub timestamp_nanos: i64,
    /// Flattened and coerced fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub document: Source,
    /// Body as submitted.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub source: Value,
}

impl WalEntry {
    pub fn new(action: Action, doc_id: impl Into<String>, target: ShardTarget) -> Self {
        WalEntry {
            seq: 0,
            action,
            doc_id: doc_id.into(),
            target,
            timestamp_nanos: 0,
            document: Source::new(),
            source: Value::Null,
        }
    }

    pub fn with_document(mut self, document: Source, source: Value, timestamp_nanos: i64) -> Self {
        self.document = document;
        self.source = source;
        self.timestamp_nanos = timestamp_nanos;
        self
    }
}

#[derive(Debug, Default)]
struct LogState {
    first_seq: SeqId,
    /// Byte offset of entry `first_seq + i`.
    offsets: Vec<u64>,
    /// End of the last complete record.
    end: u64,
}

impl LogState {
    fn last_seq(&self) -> SeqId {
        if self.offsets.is_empty() {
            0
        } else {
            self.first_seq + self.offsets.len() as u64 - 1
        }
    }

    fn next_seq(&self) -> SeqId {
        self.first_seq + self.offsets.len() as u64
    }

    fn offset_of(&self, seq: SeqId) -> Option<u64> {
        if seq < self.first_seq {
            return None;
        }
        self.offsets.get((seq - self.first_seq) as usize).copied()
    }
}

/// Append-only log with point reads and front truncation.
///
/// Appends and truncation are serialized through the writer mutex. Reads take
/// a snapshot of the offset table and go to storage directly.
#[derive(Debug)]
pub struct WriteAheadLog {
    storage: Arc<dyn Storage>,
    path: String,
    writer: Mutex<Option<Box<dyn StorageOutput>>>,
    state: RwLock<LogState>,
}

impl WriteAheadLog {
    /// Open or create the log at `path`, scanning it to rebuild the offset
    /// table.
    pub fn open(storage: Arc<dyn Storage>, path: &str) -> Result<Self> {
        let mut state = LogState {
            first_seq: 1,
            ..Default::default()
        };

        if storage.file_exists(path) {
            let bytes = storage::read_all(storage.as_ref(), path)?;
            let len = bytes.len() as u64;
            let mut pos = 0u64;
            let mut expected: Option<SeqId> = None;

            while pos < len {
                if pos + HEADER_LEN > len {
                    break;
                }
                let header = &bytes[pos as usize..(pos + HEADER_LEN) as usize];
                let body_len = LittleEndian::read_u32(&header[0..4]) as u64;
                let crc = LittleEndian::read_u32(&header[4..8]);
                let end = pos + HEADER_LEN + body_len;
                if end > len {
                    break;
                }
                let body = &bytes[(pos + HEADER_LEN) as usize..end as usize];
                if crc32fast::hash(body) != crc {
                    if end == len {
                        break;
                    }
                    return Err(TesseraError::recovery(format!(
                        "wal [{path}] corrupt record at offset {pos}"
                    )));
                }
                let entry: WalEntry = serde_json::from_slice(body).map_err(|e| {
                    TesseraError::recovery(format!(
                        "wal [{path}] unreadable record at offset {pos}: {e}"
                    ))
                })?;
                match expected {
                    None => state.first_seq = entry.seq,
                    Some(seq) if seq != entry.seq => {
                        return Err(TesseraError::recovery(format!(
                            "wal [{path}] expected sequence {seq}, found {}",
                            entry.seq
                        )));
                    }
                    Some(_) => {}
                }
                expected = Some(entry.seq + 1);
                state.offsets.push(pos);
                pos = end;
            }

            state.end = pos;
            if pos < len {
                warn!(
                    "wal [{path}] dropping {} bytes of incomplete tail record",
                    len - pos
                );
                storage::write_atomic(storage.as_ref(), path, &bytes[..pos as usize], true)?;
            }
        }

        Ok(WriteAheadLog {
            storage,
            path: path.to_string(),
            writer: Mutex::new(None),
            state: RwLock::new(state),
        })
    }

    fn encode(entry: &WalEntry) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(entry)?;
        let mut buf = Vec::with_capacity(HEADER_LEN as usize + body.len());
        buf.write_u32::<LittleEndian>(body.len() as u32)?;
        buf.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Append one entry and return its sequence id.
    pub fn append(&self, entry: WalEntry) -> Result<SeqId> {
        let seqs = self.append_batch(vec![entry])?;
        Ok(seqs[0])
    }

    /// Append entries with a single sync. Either all of them become durable or
    /// none are acknowledged.
    pub fn append_batch(&self, entries: Vec<WalEntry>) -> Result<Vec<SeqId>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut writer = self.writer.lock();

        let (mut seq, start) = {
            let state = self.state.read();
            (state.next_seq(), state.end)
        };

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        let mut seqs = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.seq = seq;
            offsets.push(start + buf.len() as u64);
            seqs.push(seq);
            buf.extend_from_slice(&Self::encode(&entry)?);
            seq += 1;
        }

        if writer.is_none() {
            *writer = Some(self.storage.create_output_append(&self.path)?);
        }
        let result = match writer.as_mut() {
            Some(output) => output
                .write_all(&buf)
                .map_err(TesseraError::from)
                .and_then(|_| output.flush_and_sync()),
            None => Err(TesseraError::internal("wal writer missing")),
        };
        if let Err(e) = result {
            *writer = None;
            self.repair_tail(start);
            return Err(TesseraError::durability(format!(
                "wal [{}] append failed: {e}",
                self.path
            )));
        }

        let mut state = self.state.write();
        state.offsets.extend(offsets);
        state.end = start + buf.len() as u64;
        Ok(seqs)
    }

    /// Cut a half-written append so later appends stay contiguous.
    fn repair_tail(&self, end: u64) {
        let result = self.read_prefix(end).and_then(|bytes| {
            storage::write_atomic(self.storage.as_ref(), &self.path, &bytes, true)
        });
        if let Err(e) = result {
            error!("wal [{}] failed to cut partial append: {e}", self.path);
        }
    }

    fn read_prefix(&self, end: u64) -> Result<Vec<u8>> {
        let mut input = self.storage.open_input(&self.path)?;
        let mut bytes = vec![0u8; end.min(input.size()?) as usize];
        input.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_record<R: Read>(&self, input: &mut R, seq: SeqId) -> Result<WalEntry> {
        let corrupt = |what: &str| {
            TesseraError::recovery(format!("wal [{}] entry {seq} {what}", self.path))
        };
        let mut header = [0u8; HEADER_LEN as usize];
        input
            .read_exact(&mut header)
            .map_err(|_| corrupt("truncated header"))?;
        let body_len = LittleEndian::read_u32(&header[0..4]) as usize;
        let crc = LittleEndian::read_u32(&header[4..8]);
        let mut body = vec![0u8; body_len];
        input
            .read_exact(&mut body)
            .map_err(|_| corrupt("truncated body"))?;
        if crc32fast::hash(&body) != crc {
            return Err(corrupt("checksum mismatch"));
        }
        let entry: WalEntry =
            serde_json::from_slice(&body).map_err(|e| corrupt(&format!("unreadable: {e}")))?;
        if entry.seq != seq {
            return Err(corrupt(&format!("holds sequence {}", entry.seq)));
        }
        Ok(entry)
    }

    /// Read one entry.
    pub fn read(&self, seq: SeqId) -> Result<WalEntry> {
        let offset = self.state.read().offset_of(seq).ok_or_else(|| {
            TesseraError::not_found(format!("wal [{}] entry {seq}", self.path))
        })?;
        let mut input = self.storage.open_input(&self.path)?;
        input.seek(SeekFrom::Start(offset))?;
        self.read_record(&mut input, seq)
    }

    /// Read entries `first..=last` in order.
    pub fn read_range(&self, first: SeqId, last: SeqId) -> Result<Vec<WalEntry>> {
        if first > last {
            return Ok(Vec::new());
        }
        let (offset, last_seq) = {
            let state = self.state.read();
            (state.offset_of(first), state.last_seq())
        };
        let offset = match offset {
            Some(offset) if last <= last_seq => offset,
            _ => {
                return Err(TesseraError::not_found(format!(
                    "wal [{}] range {first}..={last}",
                    self.path
                )));
            }
        };
        let mut input = self.storage.open_input(&self.path)?;
        input.seek(SeekFrom::Start(offset))?;
        let mut input = std::io::BufReader::new(input);
        (first..=last)
            .map(|seq| self.read_record(&mut input, seq))
            .collect()
    }

    /// Sequence id of the oldest retained entry, 0 when empty.
    pub fn first_seq(&self) -> SeqId {
        let state = self.state.read();
        if state.offsets.is_empty() {
            0
        } else {
            state.first_seq
        }
    }

    /// Sequence id of the newest entry, 0 when empty.
    pub fn last_seq(&self) -> SeqId {
        self.state.read().last_seq()
    }

    pub fn len(&self) -> usize {
        self.state.read().offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of retained entries.
    pub fn size(&self) -> u64 {
        self.state.read().end
    }

    /// Drop every entry before `first`; `first` itself is kept.
    pub fn truncate_front(&self, first: SeqId) -> Result<()> {
        let mut writer = self.writer.lock();
        let (cut, end, index) = {
            let state = self.state.read();
            if state.offsets.is_empty() || first <= state.first_seq {
                return Ok(());
            }
            if first > state.last_seq() {
                return Err(TesseraError::invalid_argument(format!(
                    "wal [{}] cannot truncate to {first}, last entry is {}",
                    self.path,
                    state.last_seq()
                )));
            }
            let index = (first - state.first_seq) as usize;
            (state.offsets[index], state.end, index)
        };

        *writer = None;
        let mut input = self.storage.open_input(&self.path)?;
        input.seek(SeekFrom::Start(cut))?;
        let mut tail = vec![0u8; (end - cut) as usize];
        input.read_exact(&mut tail)?;
        storage::write_atomic(self.storage.as_ref(), &self.path, &tail, true)?;

        let mut state = self.state.write();
        state.offsets.drain(..index);
        for offset in state.offsets.iter_mut() {
            *offset -= cut;
        }
        state.first_seq = first;
        state.end -= cut;
        Ok(())
    }

    /// Release the file handle. The log can still be read.
    pub fn close(&self) -> Result<()> {
        if let Some(mut output) = self.writer.lock().take() {
            output.flush_and_sync()?;
        }
        Ok(())
    }
}
