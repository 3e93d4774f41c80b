//! Index shards and their sub-shards.
//!
//! An [`IndexShard`] is the placement unit: it owns one WAL, one redo log and
//! an ordered list of [`SubShard`]s. Only the newest sub-shard receives new
//! documents. Once its segment directory grows past the roll threshold, its
//! time range is frozen and a fresh sub-shard is appended.
//!
//! # Consumption
//!
//! [`IndexShard::consume`] drains the WAL from the last applied sequence id:
//!
//! 1. Recover first if the previous run died between its two checkpoints.
//! 2. Read up to `max_batch_entries` entries and merge them per document.
//! 3. For every flush write the *Read* checkpoint, apply one batch per
//!    sub-shard, then write the *Write* checkpoint.
//! 4. Truncate the WAL, roll the sub-shard if needed and persist statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::error::{Result, TesseraError};
use crate::index::IndexCore;
use crate::mapping::Mapping;
use crate::meta::{ShardRecord, SubShardRecord};
use crate::merge::WalMergeDocs;
use crate::segment::{SegmentBatch, SegmentDocument, SegmentReader, SegmentStore, SegmentWriter};
use crate::storage::Storage;
use crate::wal::redo::{RedoKey, RedoLog};
use crate::wal::{SeqId, WalEntry, WriteAheadLog};

/// Segment directory of a sub-shard.
pub fn sub_shard_dir(index: &str, shard: &str, sub_shard: u64) -> String {
    format!("{index}/{shard}/{sub_shard:06x}")
}

/// Storage prefix holding an index shard's WAL and redo log.
pub fn wal_dir(index: &str, shard: &str) -> String {
    format!("wal/{index}/{shard}")
}

/// One segment directory with the time range of the documents written to it.
#[derive(Debug)]
pub struct SubShard {
    id: u64,
    dir: String,
    store: Arc<dyn SegmentStore>,
    writer: Mutex<Option<Arc<dyn SegmentWriter>>>,
    time: Mutex<Option<(i64, i64)>>,
    storage_size: Mutex<u64>,
}

impl SubShard {
    fn new(dir: String, record: &SubShardRecord, store: Arc<dyn SegmentStore>) -> Self {
        SubShard {
            id: record.id,
            dir,
            store,
            writer: Mutex::new(None),
            time: Mutex::new(record.time_range()),
            storage_size: Mutex::new(record.storage_size),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Writer, opened on first use.
    pub fn writer(&self) -> Result<Arc<dyn SegmentWriter>> {
        let mut writer = self.writer.lock();
        if let Some(writer) = writer.as_ref() {
            return Ok(writer.clone());
        }
        let opened = self.store.open_writer(&self.dir)?;
        *writer = Some(opened.clone());
        Ok(opened)
    }

    pub fn reader(&self) -> Result<Arc<dyn SegmentReader>> {
        match self.writer.lock().as_ref() {
            Some(writer) => writer.reader(),
            None => self.store.open_reader(&self.dir),
        }
    }

    pub fn contains(&self, doc_id: &str) -> Result<bool> {
        self.reader()?.contains(doc_id)
    }

    /// `(doc_time_min, doc_time_max)` in nanoseconds, `None` while empty.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        *self.time.lock()
    }

    fn observe(&self, timestamps: impl Iterator<Item = i64>) {
        let mut time = self.time.lock();
        for ts in timestamps {
            *time = Some(match *time {
                Some((min, max)) => (min.min(ts), max.max(ts)),
                None => (ts, ts),
            });
        }
    }

    fn apply(&self, batch: &SegmentBatch) -> Result<()> {
        self.writer()?.batch(batch)?;
        self.observe(batch.timestamps());
        Ok(())
    }

    fn record(&self) -> SubShardRecord {
        let mut record = SubShardRecord::new(self.id);
        if let Some((min, max)) = self.time_range() {
            record.doc_time_min = min;
            record.doc_time_max = max;
        }
        record.storage_size = *self.storage_size.lock();
        record
    }

    fn close(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().take() {
            writer.close()?;
        }
        Ok(())
    }
}

/// Outcome of one consumption run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    /// WAL entries consumed.
    pub entries: u64,
    /// Segment batches applied.
    pub batches: usize,
    /// Whether a new sub-shard was rolled.
    pub rolled: bool,
}

/// A sub-shard reader returned by time-pruned lookups.
#[derive(Debug, Clone)]
pub struct ShardReader {
    pub shard: String,
    pub sub_shard: u64,
    pub time_range: Option<(i64, i64)>,
    pub reader: Arc<dyn SegmentReader>,
}

#[derive(Debug)]
pub struct IndexShard {
    core: Arc<IndexCore>,
    id: String,
    store: Arc<dyn SegmentStore>,
    subs: RwLock<Vec<Arc<SubShard>>>,
    wal: WriteAheadLog,
    redo: RedoLog,
    consume_lock: Mutex<()>,
    closed: AtomicBool,
}

impl IndexShard {
    /// Open the shard's WAL and sub-shards, rolling back a half-applied
    /// batch left by a crash.
    pub fn open(
        core: Arc<IndexCore>,
        id: &str,
        storage: Arc<dyn Storage>,
        store: Arc<dyn SegmentStore>,
    ) -> Result<Arc<Self>> {
        let record = core.shard_record(id).ok_or_else(|| {
            TesseraError::not_found(format!("shard [{}/{id}]", core.name()))
        })?;
        let dir = wal_dir(core.name(), id);
        let wal = WriteAheadLog::open(storage.clone(), &format!("{dir}/wal.log"))?;
        let redo = RedoLog::open(
            storage,
            &format!("{dir}/redo.log"),
            core.config().wal.redo_no_sync,
        )?;
        let subs = record
            .sub_shards
            .iter()
            .map(|sub| {
                Arc::new(SubShard::new(
                    sub_shard_dir(core.name(), id, sub.id),
                    sub,
                    store.clone(),
                ))
            })
            .collect();

        let shard = Arc::new(IndexShard {
            core,
            id: id.to_string(),
            store,
            subs: RwLock::new(subs),
            wal,
            redo,
            consume_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        shard.recover()?;
        Ok(shard)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index_name(&self) -> &str {
        self.core.name()
    }

    /// `"{index}/{shard}"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.core.name(), self.id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn redo(&self) -> &RedoLog {
        &self.redo
    }

    pub fn sub_shards(&self) -> Vec<Arc<SubShard>> {
        self.subs.read().clone()
    }

    fn sub_shard(&self, id: u64) -> Option<Arc<SubShard>> {
        self.subs.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn latest_sub_shard(&self) -> Result<Arc<SubShard>> {
        self.subs
            .read()
            .last()
            .cloned()
            .ok_or_else(|| TesseraError::internal(format!("shard [{}] has no sub-shards", self.key())))
    }

    fn sub_shard_ids(&self) -> Vec<u64> {
        self.subs.read().iter().map(|s| s.id).collect()
    }

    /// Durably append an entry.
    pub fn append(&self, entry: WalEntry) -> Result<SeqId> {
        if self.is_closed() {
            return Err(TesseraError::durability(format!(
                "shard [{}] is closed",
                self.key()
            )));
        }
        self.wal.append(entry).map_err(|e| match e {
            TesseraError::Durability(_) => e,
            other => TesseraError::durability(format!("shard [{}]: {other}", self.key())),
        })
    }

    /// Sub-shard currently holding `doc_id`, searching newest-first.
    pub fn find_sub_shard_by_doc_id(&self, doc_id: &str) -> Result<Option<u64>> {
        let subs: Vec<Arc<SubShard>> = self.subs.read().iter().rev().cloned().collect();
        let concurrency = self.core.config().shard.concurrency.max(1);
        for chunk in subs.chunks(concurrency) {
            let hits = if chunk.len() == 1 {
                vec![chunk[0].contains(doc_id)?]
            } else {
                chunk
                    .par_iter()
                    .map(|sub| sub.contains(doc_id))
                    .collect::<Result<Vec<bool>>>()?
            };
            if let Some(pos) = hits.iter().position(|hit| *hit) {
                return Ok(Some(chunk[pos].id));
            }
        }
        Ok(None)
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Option<SegmentDocument>> {
        match self.find_sub_shard_by_doc_id(doc_id)?.and_then(|id| self.sub_shard(id)) {
            Some(sub) => sub.reader()?.get(doc_id),
            None => Ok(None),
        }
    }

    /// Undo a batch that was dequeued but never confirmed.
    ///
    /// Inserts from the ambiguous range are deleted; the range stays in the
    /// WAL and is applied again by the next run.
    fn recover(&self) -> Result<()> {
        let Some(read) = self.redo.read_checkpoint(RedoKey::Read) else {
            return Ok(());
        };
        let write = self.redo.read_checkpoint(RedoKey::Write);
        if write == Some(read) {
            return Ok(());
        }
        info!(
            "shard [{}] rolling back wal range min_id={} max_id={}",
            self.key(),
            read.min_id,
            read.max_id
        );

        let entries = self.wal.read_range(read.min_id, read.max_id).map_err(|e| {
            TesseraError::recovery(format!("shard [{}] rollback read: {e}", self.key()))
        })?;
        let mut docs = WalMergeDocs::new(self.latest_sub_shard()?.id);
        for entry in entries {
            docs.add_entry(entry, |doc_id| self.find_sub_shard_by_doc_id(doc_id))?;
        }
        for (sub_id, batch) in docs.plan_rollback() {
            let sub = self.sub_shard(sub_id).ok_or_else(|| {
                TesseraError::recovery(format!("shard [{}] unknown sub-shard {sub_id}", self.key()))
            })?;
            sub.writer()?.batch(&batch).map_err(|e| {
                TesseraError::recovery(format!(
                    "shard [{}] sub_shard={sub_id} rollback batch: {e}",
                    self.key()
                ))
            })?;
        }

        if read.min_id > 1 {
            if let Err(e) = self.wal.truncate_front(read.min_id - 1) {
                warn!("shard [{}] truncate after rollback: {e}", self.key());
            }
        }
        let write = write.unwrap_or_default();
        if self.redo.read_checkpoint(RedoKey::Write).is_none() {
            self.redo.write_checkpoint(RedoKey::Write, 0, 0)?;
        }
        self.redo
            .write_checkpoint(RedoKey::Read, write.min_id, write.max_id)?;
        info!("shard [{}] rollback done", self.key());
        Ok(())
    }

    /// Drain pending WAL entries into the segment store.
    pub fn consume(&self) -> Result<ConsumeStats> {
        let _guard = self.consume_lock.lock();
        let mut stats = ConsumeStats::default();
        if self.is_closed() {
            return Ok(stats);
        }
        self.recover()?;

        let last = self.wal.last_seq();
        let applied = self
            .redo
            .read_checkpoint(RedoKey::Write)
            .map(|c| c.max_id)
            .unwrap_or(0);
        let min_id = (applied + 1).max(self.wal.first_seq());
        if last == 0 || last < min_id {
            return Ok(stats);
        }
        let max_id = last.min(min_id + self.core.config().wal.max_batch_entries - 1);

        let mapping = self.core.mapping();
        let batch_size = self.core.config().batch_size;
        let entries = self.wal.read_range(min_id, max_id)?;
        let mut docs = WalMergeDocs::new(self.latest_sub_shard()?.id);
        let mut flush_min = min_id;
        for entry in entries {
            let seq = entry.seq;
            docs.add_entry(entry, |doc_id| self.find_sub_shard_by_doc_id(doc_id))?;
            if docs.max_group_len() >= batch_size {
                stats.batches += self.flush(&mut docs, &mapping, flush_min, seq)?;
                flush_min = seq + 1;
            }
        }
        if flush_min <= max_id {
            stats.batches += self.flush(&mut docs, &mapping, flush_min, max_id)?;
        }
        stats.entries = max_id - min_id + 1;
        debug!(
            "shard [{}] consumed min_id={min_id} max_id={max_id} batches={}",
            self.key(),
            stats.batches
        );

        if let Err(e) = self.wal.truncate_front(max_id) {
            warn!("shard [{}] truncate to {max_id}: {e}", self.key());
        }
        stats.rolled = self.check_shards()?;
        self.persist_stats()?;
        Ok(stats)
    }

    fn flush(
        &self,
        docs: &mut WalMergeDocs,
        mapping: &Mapping,
        min_id: SeqId,
        max_id: SeqId,
    ) -> Result<usize> {
        self.redo.write_checkpoint(RedoKey::Read, min_id, max_id)?;
        let mut applied = 0;
        for (sub_id, batch) in docs.plan(mapping, &self.sub_shard_ids()) {
            if batch.is_empty() {
                continue;
            }
            let sub = self.sub_shard(sub_id).ok_or_else(|| {
                TesseraError::consumption(format!("shard [{}] unknown sub-shard {sub_id}", self.key()))
            })?;
            sub.apply(&batch).map_err(|e| {
                error!(
                    "shard [{}] sub_shard={sub_id} min_id={min_id} max_id={max_id} batch failed: {e}",
                    self.key()
                );
                TesseraError::consumption(format!("shard [{}] sub_shard={sub_id}: {e}", self.key()))
            })?;
            applied += 1;
        }
        self.redo.write_checkpoint(RedoKey::Write, min_id, max_id)?;
        docs.reset();
        Ok(applied)
    }

    /// Roll to a new sub-shard once the newest one is over the size limit.
    pub fn check_shards(&self) -> Result<bool> {
        let latest = self.latest_sub_shard()?;
        let size = latest.writer()?.size()?;
        *latest.storage_size.lock() = size;
        if size <= self.core.shard_max_size() {
            return Ok(false);
        }
        self.new_sub_shard()?;
        Ok(true)
    }

    /// Freeze the newest sub-shard's time range and append a new one.
    pub fn new_sub_shard(&self) -> Result<Arc<SubShard>> {
        let latest = self.latest_sub_shard()?;
        let frozen = latest.record();
        let next = SubShardRecord::new(latest.id + 1);
        self.core.update_record(true, |record| {
            let shard = record
                .shards
                .entry(self.id.clone())
                .or_insert_with(|| ShardRecord::new(self.id.clone()));
            match shard.sub_shards.iter_mut().find(|s| s.id == frozen.id) {
                Some(sub) => *sub = frozen.clone(),
                None => shard.sub_shards.push(frozen.clone()),
            }
            shard.sub_shards.push(next.clone());
            Ok(())
        })?;

        let sub = Arc::new(SubShard::new(
            sub_shard_dir(self.core.name(), &self.id, next.id),
            &next,
            self.store.clone(),
        ));
        self.subs.write().push(sub.clone());
        info!(
            "shard [{}] rolled to sub_shard={} after sub_shard={} reached {} bytes",
            self.key(),
            next.id,
            frozen.id,
            frozen.storage_size
        );
        Ok(sub)
    }

    /// Sub-shards whose time range may overlap `[time_min, time_max]`,
    /// newest first. Zero bounds are open. Empty sub-shards are always
    /// returned.
    pub fn get_readers(&self, time_min: i64, time_max: i64) -> Result<Vec<ShardReader>> {
        let mut readers = Vec::new();
        for sub in self.subs.read().iter().rev() {
            let range = sub.time_range();
            if let Some((min, max)) = range {
                if (time_min != 0 && max < time_min) || (time_max != 0 && min > time_max) {
                    continue;
                }
            }
            readers.push(ShardReader {
                shard: self.id.clone(),
                sub_shard: sub.id,
                time_range: range,
                reader: sub.reader()?,
            });
            // Older sub-shards start earlier still.
            if time_min != 0 && range.is_some_and(|(min, _)| min < time_min) {
                break;
            }
        }
        Ok(readers)
    }

    /// Current in-memory view of this shard's record.
    pub fn record(&self) -> ShardRecord {
        ShardRecord {
            id: self.id.clone(),
            sub_shards: self.subs.read().iter().map(|s| s.record()).collect(),
            wal_size: self.wal.size(),
        }
    }

    /// Write time ranges, sizes and WAL size into the index record.
    pub fn persist_stats(&self) -> Result<()> {
        let current = self.record();
        self.core.update_record(false, |record| {
            record.shards.insert(current.id.clone(), current.clone());
            Ok(())
        })
    }

    /// Stop accepting appends and release segment writers. Waits for a
    /// running consumption to finish.
    pub fn close(&self) -> Result<()> {
        let _guard = self.consume_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.wal.close()?;
        for sub in self.subs.read().iter() {
            sub.close()?;
        }
        debug!("shard [{}] closed", self.key());
        Ok(())
    }

    /// Remove every segment directory of this shard.
    pub fn delete_segments(&self) -> Result<()> {
        for sub in self.subs.read().iter() {
            self.store.delete_dir(sub.dir())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::index::{Index, IndexFactory};
    use crate::meta::{IndexSettings, StorageType};
    use crate::registry::WalRegistry;
    use crate::segment::{MemorySegmentStore, SegmentRegistry};
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemorySegmentStore>,
        factory: IndexFactory,
        index: Arc<Index>,
    }

    impl Fixture {
        fn new(config: EngineConfig) -> Self {
            let store = Arc::new(MemorySegmentStore::new());
            let segments = Arc::new(SegmentRegistry::new());
            segments.register(StorageType::Disk, store.clone());
            let factory = IndexFactory::new(
                Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
                segments,
                Arc::new(config),
                Arc::new(WalRegistry::new()),
            );
            let settings = IndexSettings {
                number_of_shards: 1,
                shard_max_size: None,
            };
            let index = factory
                .create("logs", StorageType::Disk, Some(settings), None, true)
                .unwrap();
            Fixture {
                store,
                factory,
                index,
            }
        }

        fn shard(&self) -> Arc<IndexShard> {
            self.index.local_shards().pop().unwrap()
        }

        fn doc_ids(&self, sub_shard: u64) -> Vec<String> {
            let shard = self.shard();
            let mut ids = self
                .store
                .doc_ids(&sub_shard_dir("logs", shard.id(), sub_shard));
            ids.sort();
            ids
        }
    }

    #[test]
    fn test_consume_applies_and_truncates() {
        let fx = Fixture::new(EngineConfig::default());
        fx.index.insert(&json!({"_id": "a", "n": 1})).unwrap();
        fx.index.insert(&json!({"_id": "b", "n": 2})).unwrap();
        fx.index.update("a", &json!({"n": 3})).unwrap();
        fx.index.delete("b").unwrap();
        fx.index.update("c", &json!({"n": 4})).unwrap();

        let shard = fx.shard();
        let stats = shard.consume().unwrap();
        assert_eq!(stats.entries, 5);
        assert_eq!(fx.doc_ids(0), vec!["a", "c"]);
        let a = fx.index.get_document("a").unwrap().unwrap();
        assert_eq!(a.get("n").and_then(|v| v.as_numeric()), Some(3.0));

        assert_eq!(shard.wal().first_seq(), 5);
        assert_eq!(shard.wal().last_seq(), 5);
        assert_eq!(shard.consume().unwrap(), ConsumeStats::default());

        fx.index.delete("a").unwrap();
        assert_eq!(shard.consume().unwrap().entries, 1);
        assert_eq!(fx.doc_ids(0), vec!["c"]);
    }

    #[test]
    fn test_failed_batch_is_retried() {
        let fx = Fixture::new(EngineConfig::default());
        fx.index.insert(&json!({"_id": "a"})).unwrap();
        let shard = fx.shard();

        fx.store.fail_next_batches(1);
        let err = shard.consume().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consumption);
        assert!(fx.doc_ids(0).is_empty());
        assert_ne!(
            shard.redo().read_checkpoint(RedoKey::Read),
            shard.redo().read_checkpoint(RedoKey::Write)
        );

        assert_eq!(shard.consume().unwrap().entries, 1);
        assert_eq!(fx.doc_ids(0), vec!["a"]);
    }

    #[test]
    fn test_lost_acknowledgement_does_not_duplicate() {
        let fx = Fixture::new(EngineConfig::default());
        let mut ids = vec![
            fx.index.insert(&json!({"msg": "a"})).unwrap(),
            fx.index.insert(&json!({"msg": "b"})).unwrap(),
        ];
        ids.sort();
        let shard = fx.shard();

        fx.store.fail_after_next_batches(1);
        assert!(shard.consume().is_err());
        assert_eq!(fx.doc_ids(0), ids);

        // Reopening rolls back the unconfirmed inserts.
        let reopened = fx.factory.load("logs", true).unwrap();
        assert!(fx.doc_ids(0).is_empty());

        reopened.local_shards()[0].consume().unwrap();
        assert_eq!(fx.doc_ids(0), ids);
    }

    #[test]
    fn test_lost_acknowledgement_of_existing_id_keeps_one_copy() {
        let fx = Fixture::new(EngineConfig::default());
        fx.index.insert(&json!({"_id": "x", "n": 1})).unwrap();
        fx.shard().consume().unwrap();

        fx.index.insert(&json!({"_id": "x", "n": 2})).unwrap();
        fx.store.fail_after_next_batches(1);
        assert!(fx.shard().consume().is_err());

        let reopened = fx.factory.load("logs", true).unwrap();
        assert_eq!(fx.doc_ids(0), vec!["x"]);
        reopened.local_shards()[0].consume().unwrap();
        assert_eq!(fx.doc_ids(0), vec!["x"]);
        let x = reopened.get_document("x").unwrap().unwrap();
        assert_eq!(x.get("n").and_then(|v| v.as_numeric()), Some(2.0));
    }

    /// Runs a mixed workload over documents stored by an earlier run and
    /// returns `(id, n)` per stored document. With `crash` the second batch
    /// lands unconfirmed and the index is reopened before consuming again.
    fn replay_mixed_run(crash: bool) -> Vec<(String, Option<f64>)> {
        let fx = Fixture::new(EngineConfig::default());
        for id in ["x", "y", "w"] {
            fx.index.insert(&json!({"_id": id, "n": 1})).unwrap();
        }
        fx.shard().consume().unwrap();

        fx.index.insert(&json!({"_id": "x", "n": 2})).unwrap();
        fx.index.update("y", &json!({"n": 5})).unwrap();
        fx.index.delete("w").unwrap();
        let fresh = fx.index.insert(&json!({"n": 9})).unwrap();

        let index = if crash {
            fx.store.fail_after_next_batches(1);
            assert!(fx.shard().consume().is_err());
            fx.factory.load("logs", true).unwrap()
        } else {
            fx.index.clone()
        };
        let shard = index.local_shards()[0].clone();
        shard.consume().unwrap();

        let dir = sub_shard_dir("logs", shard.id(), 0);
        let reader = fx.store.open_reader(&dir).unwrap();
        let mut state: Vec<(String, Option<f64>)> = fx
            .store
            .doc_ids(&dir)
            .into_iter()
            .map(|id| {
                let n = reader
                    .get(&id)
                    .unwrap()
                    .and_then(|doc| doc.get("n").and_then(|v| v.as_numeric()));
                let label = if id == fresh { "fresh".to_string() } else { id };
                (label, n)
            })
            .collect();
        state.sort_by(|a, b| a.0.cmp(&b.0));
        state
    }

    #[test]
    fn test_crash_replay_matches_uninterrupted_run() {
        let clean = replay_mixed_run(false);
        assert_eq!(
            clean,
            vec![
                ("fresh".to_string(), Some(9.0)),
                ("x".to_string(), Some(2.0)),
                ("y".to_string(), Some(5.0)),
            ]
        );
        assert_eq!(replay_mixed_run(true), clean);
    }

    #[test]
    fn test_pre_epoch_documents_are_pruned() {
        let fx = Fixture::new(EngineConfig::default());
        fx.index
            .insert(&json!({"@timestamp": "1960-01-01T00:00:00Z"}))
            .unwrap();
        let shard = fx.shard();
        assert_eq!(shard.latest_sub_shard().unwrap().time_range(), None);
        shard.consume().unwrap();

        let ts = Utc
            .with_ymd_and_hms(1960, 1, 1, 0, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        let record = fx.index.record().shards[shard.id()].clone();
        assert_eq!(record.sub_shards[0].time_range(), Some((ts, ts)));

        let recent = 1_700_000_000_000_000_000;
        assert!(shard.get_readers(recent, recent + 1_000_000_000).unwrap().is_empty());
        assert_eq!(shard.get_readers(ts - 1, ts + 1).unwrap().len(), 1);
        assert_eq!(shard.get_readers(0, 0).unwrap().len(), 1);

        // The range survives a reopen.
        let reopened = fx.factory.load("logs", true).unwrap();
        let sub = reopened.local_shards()[0].latest_sub_shard().unwrap();
        assert_eq!(sub.time_range(), Some((ts, ts)));
    }

    #[test]
    fn test_batch_size_splits_run() {
        let config = EngineConfig::builder().batch_size(2).build().unwrap();
        let fx = Fixture::new(config);
        for i in 0..5 {
            fx.index.insert(&json!({"_id": format!("d{i}")})).unwrap();
        }
        let stats = fx.shard().consume().unwrap();
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.batches, 3);
        assert_eq!(fx.doc_ids(0).len(), 5);
        let write = fx.shard().redo().read_checkpoint(RedoKey::Write).unwrap();
        assert_eq!((write.min_id, write.max_id), (5, 5));
    }

    #[test]
    fn test_roll_freezes_time_range() {
        let config = EngineConfig::builder().shard_max_size(1).build().unwrap();
        let fx = Fixture::new(config);
        fx.index
            .insert(&json!({"@timestamp": "2024-01-01T00:00:00Z", "msg": "first"}))
            .unwrap();
        let shard = fx.shard();
        assert!(shard.consume().unwrap().rolled);

        let record = fx.index.record().shards[shard.id()].clone();
        assert_eq!(record.sub_shards.len(), 2);
        assert!(record.sub_shards[0].doc_time_min > 0);
        assert_eq!(record.sub_shards[0].doc_time_min, record.sub_shards[0].doc_time_max);
        assert_eq!(shard.latest_sub_shard().unwrap().id(), 1);
    }
}
