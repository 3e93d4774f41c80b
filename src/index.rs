//! Indexes: mapping, settings, shards and document ingestion.
//!
//! An [`Index`] routes each document to one of the index shards it serves
//! locally through a rendezvous ring. Before anything reaches the WAL the
//! document is flattened, checked against the mapping and coerced; a mapping
//! change is persisted with the index record first.
//!
//! [`IndexCore`] is the part shared with every [`IndexShard`]: name,
//! configuration, the persisted record and the mapping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cluster::ring::Rendezvous;
use crate::config::EngineConfig;
use crate::data::{self, Source};
use crate::error::{Result, TesseraError};
use crate::mapping::{ID_FIELD, Mapping, TIMESTAMP_FIELD};
use crate::meta::{IndexRecord, IndexSettings, MetaStore, ShardRecord, StorageType};
use crate::registry::WalRegistry;
use crate::segment::{SegmentDocument, SegmentRegistry, SegmentStore};
use crate::shard::{self, IndexShard, ShardReader};
use crate::storage::{self, Storage};
use crate::wal::{Action, ShardTarget, WalEntry};

/// State shared by an index and its shards.
#[derive(Debug)]
pub struct IndexCore {
    name: String,
    storage_type: StorageType,
    config: Arc<EngineConfig>,
    meta: MetaStore,
    record: Mutex<IndexRecord>,
    record_update: Mutex<()>,
    mapping: RwLock<Mapping>,
    mapping_update: Mutex<()>,
    version: watch::Sender<u64>,
}

impl IndexCore {
    fn new(record: IndexRecord, config: Arc<EngineConfig>, meta: MetaStore) -> Result<Self> {
        let mapping = record.mapping()?;
        let (version, _) = watch::channel(record.version);
        Ok(IndexCore {
            name: record.name.clone(),
            storage_type: record.storage_type,
            config,
            meta,
            record: Mutex::new(record),
            record_update: Mutex::new(()),
            mapping: RwLock::new(mapping),
            mapping_update: Mutex::new(()),
            version,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the current mapping.
    pub fn mapping(&self) -> Mapping {
        self.mapping.read().clone()
    }

    pub fn record(&self) -> IndexRecord {
        self.record.lock().clone()
    }

    pub fn version(&self) -> u64 {
        self.record.lock().version
    }

    pub fn shard_record(&self, id: &str) -> Option<ShardRecord> {
        self.record.lock().shards.get(id).cloned()
    }

    /// Roll threshold: the index setting, else the engine default.
    pub fn shard_max_size(&self) -> u64 {
        self.record
            .lock()
            .settings
            .shard_max_size
            .unwrap_or(self.config.shard.max_size)
    }

    /// Read-modify-write of the persisted record.
    ///
    /// Starts from the stored copy so changes made by other nodes survive.
    /// `bump` increments the version and notifies version subscribers.
    /// Writers are serialized by `record_update`; the in-memory record is only
    /// locked to read the version and to swap in the result.
    pub fn update_record<F>(&self, bump: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut IndexRecord) -> Result<()>,
    {
        let _writer = self.record_update.lock();
        let known = self.record.lock().version;
        let mut next = self
            .meta
            .get(&self.name)?
            .ok_or_else(|| TesseraError::not_found(format!("index [{}]", self.name)))?;
        f(&mut next)?;
        if bump {
            next.version = next.version.max(known) + 1;
        }
        next.updated_at = Utc::now();
        self.meta.put(&next)?;
        let version = next.version;
        *self.record.lock() = next;
        if bump {
            self.version.send_replace(version);
        }
        Ok(())
    }

    /// Replace the in-memory record with a newer persisted one.
    fn reload(&self, record: IndexRecord) -> Result<bool> {
        let mut current = self.record.lock();
        if record.version < current.version || record == *current {
            return Ok(false);
        }
        let mapping = record.mapping()?;
        let version = record.version;
        *self.mapping.write() = mapping;
        *current = record;
        self.version.send_if_modified(|v| {
            *v = version;
            false
        });
        Ok(true)
    }

    /// Flatten, infer and coerce a document body, and resolve its time.
    ///
    /// New fields are persisted before this returns, and only once the whole
    /// document, timestamp included, has been accepted.
    pub fn check_document(&self, body: &Source) -> Result<(Source, i64)> {
        let auto_keyword = self.config.mapping.auto_keyword;
        let flat = data::flatten(body);

        let mut checked = flat.clone();
        let mut current = self.mapping();
        if !current.check_document(&mut checked, auto_keyword)? {
            let timestamp = document_timestamp(&current, &checked)?;
            return Ok((checked, timestamp));
        }

        let _guard = self.mapping_update.lock();
        let mut checked = flat;
        let mut next = self.mapping();
        let changed = next.check_document(&mut checked, auto_keyword)?;
        let timestamp = document_timestamp(&next, &checked)?;
        if changed {
            self.commit_mapping(&next)?;
        }
        Ok((checked, timestamp))
    }

    /// Merge `next` into the stored mapping and publish it. Callers hold
    /// `mapping_update`.
    fn commit_mapping(&self, next: &Mapping) -> Result<()> {
        let mut merged = None;
        self.update_record(true, |record| {
            let mut stored = record.mapping()?;
            stored.merge(next)?;
            record.set_mapping(&stored)?;
            merged = Some(stored);
            Ok(())
        })?;
        if let Some(merged) = merged {
            debug!("index [{}] mapping now has {} fields", self.name, merged.len());
            *self.mapping.write() = merged;
        }
        Ok(())
    }
}

/// Document time in nanoseconds: `@timestamp` when present, else now.
pub fn document_timestamp(mapping: &Mapping, flat: &Source) -> Result<i64> {
    let time = match flat.get(TIMESTAMP_FIELD).filter(|v| !v.is_null()) {
        Some(value) => {
            let prop = mapping.get(TIMESTAMP_FIELD);
            data::parse_time(
                value,
                prop.and_then(|p| p.format.as_deref()),
                prop.and_then(|p| p.time_zone.as_deref()),
            )?
        }
        None => Utc::now(),
    };
    time.timestamp_nanos_opt()
        .ok_or_else(|| TesseraError::validation(format!("timestamp [{time}] out of range")))
}

/// Twelve hex characters of a random uuid.
pub fn new_shard_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[derive(Debug)]
pub struct Index {
    core: Arc<IndexCore>,
    storage: Arc<dyn Storage>,
    store: Arc<dyn SegmentStore>,
    shards: RwLock<BTreeMap<String, Arc<IndexShard>>>,
    ring: Rendezvous,
    wals: Arc<WalRegistry>,
}

impl Index {
    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn core(&self) -> &Arc<IndexCore> {
        &self.core
    }

    pub fn storage_type(&self) -> StorageType {
        self.core.storage_type()
    }

    pub fn settings(&self) -> IndexSettings {
        self.core.record.lock().settings.clone()
    }

    pub fn mapping(&self) -> Mapping {
        self.core.mapping()
    }

    pub fn record(&self) -> IndexRecord {
        self.core.record()
    }

    pub fn version(&self) -> u64 {
        self.core.version()
    }

    /// Notified on every version bump made by this process.
    pub fn subscribe_version(&self) -> watch::Receiver<u64> {
        self.core.version.subscribe()
    }

    /// Every shard of the index, wherever it is served.
    pub fn shard_ids(&self) -> Vec<String> {
        self.core.record.lock().shards.keys().cloned().collect()
    }

    /// Shards served by this node.
    pub fn local_shard_ids(&self) -> Vec<String> {
        self.shards.read().keys().cloned().collect()
    }

    pub fn local_shards(&self) -> Vec<Arc<IndexShard>> {
        self.shards.read().values().cloned().collect()
    }

    pub fn shard(&self, id: &str) -> Option<Arc<IndexShard>> {
        self.shards.read().get(id).cloned()
    }

    pub fn ring(&self) -> &Rendezvous {
        &self.ring
    }

    /// Insert a document. Without `_id` a fresh id is generated; with one the
    /// document replaces any stored copy.
    pub fn insert(&self, body: &Value) -> Result<String> {
        self.submit(Action::Insert, None, Some(body))
    }

    /// Replace a document, or create it when no shard holds it.
    pub fn update(&self, doc_id: &str, body: &Value) -> Result<String> {
        self.submit(Action::Update, Some(doc_id), Some(body))
    }

    pub fn delete(&self, doc_id: &str) -> Result<String> {
        self.submit(Action::Delete, Some(doc_id), None)
    }

    /// Validate a mutation and append it to the owning shard's WAL.
    /// Returns the document id once the entry is durable.
    pub fn submit(&self, action: Action, doc_id: Option<&str>, body: Option<&Value>) -> Result<String> {
        let doc_id = doc_id.filter(|id| !id.is_empty()).map(str::to_string);
        let entry = match action {
            Action::Delete => {
                let doc_id = doc_id
                    .ok_or_else(|| TesseraError::validation("delete requires a document id"))?;
                WalEntry::new(Action::Delete, doc_id, ShardTarget::NeedUpdate)
            }
            Action::Insert | Action::Update => {
                let Some(Value::Object(obj)) = body else {
                    return Err(TesseraError::validation("document must be a JSON object"));
                };
                let doc_id = doc_id.or_else(|| {
                    obj.get(ID_FIELD)
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                });
                // A caller-chosen id may already be stored, so it is logged as
                // an upsert. Only generated ids are plain inserts.
                let (action, doc_id, target) = match (action, doc_id) {
                    (Action::Insert, None) => (
                        Action::Insert,
                        Uuid::new_v4().to_string(),
                        ShardTarget::NeedLatest,
                    ),
                    (_, Some(id)) => (Action::Update, id, ShardTarget::NeedUpdate),
                    (_, None) => {
                        return Err(TesseraError::validation("update requires a document id"));
                    }
                };
                let (document, timestamp) = self.core.check_document(obj)?;
                WalEntry::new(action, doc_id, target).with_document(
                    document,
                    Value::Object(obj.clone()),
                    timestamp,
                )
            }
        };

        let shard = self.route(&entry.doc_id)?;
        let doc_id = entry.doc_id.clone();
        shard.append(entry)?;
        Ok(doc_id)
    }

    fn route(&self, doc_id: &str) -> Result<Arc<IndexShard>> {
        self.ring
            .lookup(doc_id)
            .and_then(|id| self.shard(&id))
            .ok_or_else(|| {
                TesseraError::placement(format!("index [{}] serves no shard on this node", self.name()))
            })
    }

    /// Apply an explicit schema. Returns whether anything changed.
    pub fn set_mapping(&self, mapping: &Mapping) -> Result<bool> {
        let _guard = self.core.mapping_update.lock();
        let mut next = self.core.mapping();
        if !next.merge(mapping)? {
            return Ok(false);
        }
        self.core.commit_mapping(&next)?;
        Ok(true)
    }

    /// Open a shard and start serving it.
    pub fn attach_shard(&self, id: &str) -> Result<Arc<IndexShard>> {
        if let Some(shard) = self.shard(id) {
            return Ok(shard);
        }
        let shard = IndexShard::open(self.core.clone(), id, self.storage.clone(), self.store.clone())?;
        self.shards.write().insert(id.to_string(), shard.clone());
        self.ring.add(id);
        self.wals.add(shard.clone());
        info!("index [{}] serving shard [{id}]", self.name());
        Ok(shard)
    }

    /// Stop serving a shard. Its WAL is evicted by the scheduler.
    pub fn detach_shard(&self, id: &str) -> Result<bool> {
        let Some(shard) = self.shards.write().remove(id) else {
            return Ok(false);
        };
        self.ring.remove(id);
        shard.close()?;
        info!("index [{}] released shard [{id}]", self.name());
        Ok(true)
    }

    /// Add a new, unowned shard to the index record.
    pub fn create_shard(&self) -> Result<String> {
        let id = new_shard_id();
        self.core.update_record(true, |record| {
            record.shards.insert(id.clone(), ShardRecord::new(id.clone()));
            Ok(())
        })?;
        info!("index [{}] created shard [{id}]", self.name());
        Ok(id)
    }

    /// Readers of every local sub-shard whose time range may overlap the
    /// window.
    pub fn get_readers(&self, time_min: i64, time_max: i64) -> Result<Vec<ShardReader>> {
        let mut readers = Vec::new();
        for shard in self.local_shards() {
            readers.extend(shard.get_readers(time_min, time_max)?);
        }
        Ok(readers)
    }

    /// Look a document up in the local shards.
    pub fn get_document(&self, doc_id: &str) -> Result<Option<SegmentDocument>> {
        for shard in self.local_shards() {
            if let Some(doc) = shard.get_document(doc_id)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Bytes of unconsumed WAL across local shards.
    pub fn wal_size(&self) -> u64 {
        self.local_shards().iter().map(|s| s.wal().size()).sum()
    }

    /// Persist statistics of every local shard without bumping the version.
    pub fn update_metadata(&self) -> Result<()> {
        for shard in self.local_shards() {
            shard.persist_stats()?;
        }
        Ok(())
    }

    /// Hot-reload settings, mapping and shard list from a newer record.
    pub fn reload(&self, record: IndexRecord) -> Result<bool> {
        let reloaded = self.core.reload(record)?;
        if reloaded {
            info!("index [{}] reloaded at version {}", self.name(), self.version());
        }
        Ok(reloaded)
    }

    /// Detach every local shard.
    pub fn close(&self) -> Result<()> {
        for id in self.local_shard_ids() {
            self.detach_shard(&id)?;
        }
        Ok(())
    }
}

/// Creates, loads and deletes indexes over shared storage.
#[derive(Debug, Clone)]
pub struct IndexFactory {
    storage: Arc<dyn Storage>,
    meta: MetaStore,
    segments: Arc<SegmentRegistry>,
    config: Arc<EngineConfig>,
    wals: Arc<WalRegistry>,
}

impl IndexFactory {
    pub fn new(
        storage: Arc<dyn Storage>,
        segments: Arc<SegmentRegistry>,
        config: Arc<EngineConfig>,
        wals: Arc<WalRegistry>,
    ) -> Self {
        IndexFactory {
            meta: MetaStore::new(storage.clone()),
            storage,
            segments,
            config,
            wals,
        }
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist a new index. With `attach` every shard is served locally.
    pub fn create(
        &self,
        name: &str,
        storage_type: StorageType,
        settings: Option<IndexSettings>,
        mapping: Option<&Mapping>,
        attach: bool,
    ) -> Result<Arc<Index>> {
        validate_name(name)?;
        if self.meta.get(name)?.is_some() {
            return Err(TesseraError::invalid_argument(format!(
                "index [{name}] already exists"
            )));
        }
        self.segments.get(storage_type)?;

        let settings = settings.unwrap_or_else(|| IndexSettings {
            number_of_shards: self.config.shard.num,
            shard_max_size: None,
        });
        let mut record = IndexRecord::new(name, storage_type, settings.clone());
        for _ in 0..settings.number_of_shards.max(1) {
            let id = new_shard_id();
            record.shards.insert(id.clone(), ShardRecord::new(id));
        }
        let mut full = Mapping::new();
        if let Some(mapping) = mapping {
            full.merge(mapping)?;
        }
        record.set_mapping(&full)?;
        record.version = 1;
        self.meta.put(&record)?;
        info!(
            "index [{name}] created with {} shards on [{storage_type}]",
            record.shards.len()
        );
        self.open(record, attach)
    }

    /// Open a persisted index.
    pub fn load(&self, name: &str, attach: bool) -> Result<Arc<Index>> {
        let record = self
            .meta
            .get(name)?
            .ok_or_else(|| TesseraError::not_found(format!("index [{name}]")))?;
        self.open(record, attach)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.meta.list()
    }

    fn open(&self, record: IndexRecord, attach: bool) -> Result<Arc<Index>> {
        let store = self.segments.get(record.storage_type)?;
        let shard_ids: Vec<String> = record.shards.keys().cloned().collect();
        let core = Arc::new(IndexCore::new(record, self.config.clone(), self.meta.clone())?);
        let index = Arc::new(Index {
            core,
            storage: self.storage.clone(),
            store,
            shards: RwLock::new(BTreeMap::new()),
            ring: Rendezvous::default(),
            wals: self.wals.clone(),
        });
        if attach {
            for id in &shard_ids {
                index.attach_shard(id)?;
            }
        }
        Ok(index)
    }

    /// Close the index and remove its segments, WALs and record.
    pub fn delete(&self, index: &Index) -> Result<()> {
        index.close()?;
        let record = index.record();
        let store = self.segments.get(record.storage_type)?;
        for (shard_id, shard) in &record.shards {
            for sub in &shard.sub_shards {
                store.delete_dir(&shard::sub_shard_dir(&record.name, shard_id, sub.id))?;
            }
        }
        storage::delete_prefix(self.storage.as_ref(), &format!("wal/{}/", record.name))?;
        self.meta.delete(&record.name)?;
        self.wals.evict_closed();
        info!("index [{}] deleted", record.name);
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('_')
        || name.starts_with('.')
        || name.contains(['/', '\\'])
    {
        return Err(TesseraError::invalid_argument(format!(
            "invalid index name [{name}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mapping::{FieldKind, Property};
    use crate::segment::MemorySegmentStore;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use serde_json::json;

    fn factory(config: EngineConfig) -> IndexFactory {
        let segments = Arc::new(SegmentRegistry::new());
        segments.register(StorageType::Disk, Arc::new(MemorySegmentStore::new()));
        IndexFactory::new(
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
            segments,
            Arc::new(config),
            Arc::new(WalRegistry::new()),
        )
    }

    fn one_shard() -> Option<IndexSettings> {
        Some(IndexSettings {
            number_of_shards: 1,
            shard_max_size: None,
        })
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_names() {
        let factory = factory(EngineConfig::default());
        factory
            .create("logs", StorageType::Disk, None, None, true)
            .unwrap();
        let err = factory
            .create("logs", StorageType::Disk, None, None, true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(factory.create("_sys", StorageType::Disk, None, None, true).is_err());
        assert!(factory.create("a/b", StorageType::Disk, None, None, true).is_err());
        assert!(factory.create("s3", StorageType::S3, None, None, true).is_err());
    }

    #[test]
    fn test_insert_persists_mapping_before_wal() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("books", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        let version = index.version();

        let id = index
            .insert(&json!({"title": "Dune", "meta": {"pages": 412}}))
            .unwrap();
        assert!(index.version() > version);

        let stored = factory.meta().get("books").unwrap().unwrap().mapping().unwrap();
        assert_eq!(stored.get("title").unwrap().kind, FieldKind::Text);
        assert_eq!(stored.get("meta.pages").unwrap().kind, FieldKind::Numeric);

        let shard = index.local_shards().pop().unwrap();
        let entry = shard.wal().read(1).unwrap();
        assert_eq!(entry.doc_id, id);
        assert_eq!(entry.target, ShardTarget::NeedLatest);
        assert_eq!(entry.document["meta.pages"], json!(412.0));
    }

    #[test]
    fn test_rejected_document_never_reaches_wal() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("metrics", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        index.insert(&json!({"value": 1})).unwrap();
        let err = index.insert(&json!({"value": "high"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(index.insert(&json!(["not", "an", "object"])).is_err());
        assert!(index.update("", &json!({"value": 2})).is_err());

        let shard = index.local_shards().pop().unwrap();
        assert_eq!(shard.wal().last_seq(), 1);
    }

    #[test]
    fn test_explicit_id_insert_is_an_upsert() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("users", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        index.insert(&json!({"_id": "u1", "name": "ann"})).unwrap();
        let generated = index.insert(&json!({"name": "bob"})).unwrap();

        let shard = index.local_shards().pop().unwrap();
        let explicit = shard.wal().read(1).unwrap();
        assert_eq!(explicit.doc_id, "u1");
        assert_eq!(explicit.action, Action::Update);
        assert_eq!(explicit.target, ShardTarget::NeedUpdate);
        let fresh = shard.wal().read(2).unwrap();
        assert_eq!(fresh.doc_id, generated);
        assert_eq!(fresh.action, Action::Insert);
        assert_eq!(fresh.target, ShardTarget::NeedLatest);
    }

    #[test]
    fn test_out_of_range_timestamp_leaves_mapping_untouched() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("events", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        let version = index.version();

        let err = index
            .insert(&json!({"@timestamp": "9999-01-01T00:00:00Z", "host": "a"}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(index.mapping().get("host").is_none());
        assert_eq!(index.version(), version);
        let stored = factory.meta().get("events").unwrap().unwrap();
        assert!(stored.mapping().unwrap().get("host").is_none());
        assert_eq!(index.local_shards()[0].wal().last_seq(), 0);
    }

    #[test]
    fn test_concurrent_record_updates_are_serialized() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("stats", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        let start = index.version();
        let core = index.core().clone();

        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let core = &core;
                scope.spawn(move || {
                    for i in 0..10u64 {
                        core.update_record(true, |record| {
                            record.settings.shard_max_size = Some(t * 100 + i + 1);
                            Ok(())
                        })
                        .unwrap();
                        assert!(core.version() > start);
                    }
                });
            }
        });

        assert_eq!(index.version(), start + 40);
        assert_eq!(factory.meta().get("stats").unwrap().unwrap(), index.record());
    }

    #[test]
    fn test_set_mapping_and_reload() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("users", StorageType::Disk, one_shard(), None, true)
            .unwrap();

        let mut schema = Mapping::new();
        schema
            .merge(&{
                let mut m = Mapping::new();
                m.infer("age", &json!(1), false);
                m
            })
            .unwrap();
        assert!(index.set_mapping(&schema).unwrap());
        assert!(!index.set_mapping(&schema).unwrap());

        let mut conflicting = Mapping::new();
        conflicting.infer("age", &json!("old"), false);
        assert!(index.set_mapping(&conflicting).is_err());

        // A second handle over the same storage picks the change up.
        let other = factory.load("users", false).unwrap();
        let mut record = other.record();
        record.settings.shard_max_size = Some(1024);
        record.version += 1;
        factory.meta().put(&record).unwrap();
        assert!(index.reload(record).unwrap());
        assert_eq!(index.core().shard_max_size(), 1024);
        assert_eq!(
            index.mapping().get("age").map(|p: &Property| p.kind),
            Some(FieldKind::Numeric)
        );
    }

    #[test]
    fn test_delete_removes_everything() {
        let factory = factory(EngineConfig::default());
        let index = factory
            .create("tmp", StorageType::Disk, one_shard(), None, true)
            .unwrap();
        index.insert(&json!({"a": 1})).unwrap();
        assert_eq!(factory.wals.len(), 1);

        factory.delete(&index).unwrap();
        assert!(factory.meta().get("tmp").unwrap().is_none());
        assert!(factory.wals.is_empty());
        assert!(index.insert(&json!({"a": 2})).is_err());
    }
}
