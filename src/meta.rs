//! Persisted index metadata.
//!
//! Every index is one JSON record under `index/{name}.json`, written through a
//! temporary file and renamed into place. The record carries the mapping both
//! as an opaque blob and as flat `field -> kind` pairs; readers fall back to
//! the flat pairs when the blob is missing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::mapping::Mapping;
use crate::storage::{self, Storage};

/// Backend holding an index's segment directories. Fixed at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    #[serde(rename = "disk")]
    Disk,
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "minio")]
    MinIO,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Disk => "disk",
            StorageType::S3 => "s3",
            StorageType::MinIO => "minio",
        })
    }
}

impl FromStr for StorageType {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "disk" => Ok(StorageType::Disk),
            "s3" => Ok(StorageType::S3),
            "minio" => Ok(StorageType::MinIO),
            other => Err(TesseraError::invalid_argument(format!(
                "unknown storage type [{other}]"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: usize,
    /// Overrides the engine-wide roll threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_max_size: Option<u64>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            number_of_shards: 3,
            shard_max_size: None,
        }
    }
}

/// Second-layer shard: one segment directory.
///
/// Times are nanoseconds and may be negative. Until a document is seen
/// `doc_time_min` is `i64::MAX` and `doc_time_max` is `i64::MIN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubShardRecord {
    pub id: u64,
    pub doc_time_min: i64,
    pub doc_time_max: i64,
    #[serde(default)]
    pub storage_size: u64,
}

impl SubShardRecord {
    pub fn new(id: u64) -> Self {
        SubShardRecord {
            id,
            doc_time_min: i64::MAX,
            doc_time_max: i64::MIN,
            storage_size: 0,
        }
    }

    /// `(min, max)`, or `None` while empty.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        (self.doc_time_min <= self.doc_time_max).then_some((self.doc_time_min, self.doc_time_max))
    }
}

/// First-layer shard: the placement unit, owning one WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: String,
    pub sub_shards: Vec<SubShardRecord>,
    #[serde(default)]
    pub wal_size: u64,
}

impl ShardRecord {
    pub fn new(id: impl Into<String>) -> Self {
        ShardRecord {
            id: id.into(),
            sub_shards: vec![SubShardRecord::new(0)],
            wal_size: 0,
        }
    }

    /// Overall time range across sub-shards, ignoring empty ones.
    pub fn doc_time_range(&self) -> Option<(i64, i64)> {
        time_range(self.sub_shards.iter().map(SubShardRecord::time_range))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub settings: IndexSettings,
    /// Bumped on every structural change (mapping, settings, shard list).
    #[serde(default)]
    pub version: u64,
    /// Serialized [`Mapping`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<String>,
    /// Legacy flat `field -> kind` pairs.
    #[serde(default)]
    pub mapping_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub shards: BTreeMap<String, ShardRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn new(name: impl Into<String>, storage_type: StorageType, settings: IndexSettings) -> Self {
        let now = Utc::now();
        IndexRecord {
            name: name.into(),
            storage_type,
            settings,
            version: 0,
            mappings: None,
            mapping_fields: BTreeMap::new(),
            shards: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Mapping from the blob, or from the flat pairs when the blob is absent.
    pub fn mapping(&self) -> Result<Mapping> {
        match &self.mappings {
            Some(blob) => Ok(serde_json::from_str(blob)?),
            None => Mapping::from_flat(&self.mapping_fields),
        }
    }

    pub fn set_mapping(&mut self, mapping: &Mapping) -> Result<()> {
        self.mappings = Some(serde_json::to_string(mapping)?);
        self.mapping_fields = mapping.to_flat();
        Ok(())
    }

    pub fn doc_time_range(&self) -> Option<(i64, i64)> {
        time_range(self.shards.values().map(ShardRecord::doc_time_range))
    }

    pub fn wal_size(&self) -> u64 {
        self.shards.values().map(|s| s.wal_size).sum()
    }

    pub fn storage_size(&self) -> u64 {
        self.shards
            .values()
            .flat_map(|s| s.sub_shards.iter())
            .map(|s| s.storage_size)
            .sum()
    }
}

fn time_range(ranges: impl Iterator<Item = Option<(i64, i64)>>) -> Option<(i64, i64)> {
    ranges.flatten().reduce(|(min, max), (lo, hi)| (min.min(lo), max.max(hi)))
}

/// Index records over a [`Storage`].
#[derive(Debug, Clone)]
pub struct MetaStore {
    storage: Arc<dyn Storage>,
}

impl MetaStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        MetaStore { storage }
    }

    fn path(name: &str) -> String {
        format!("index/{name}.json")
    }

    pub fn put(&self, record: &IndexRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        storage::write_atomic(self.storage.as_ref(), &Self::path(&record.name), &bytes, true)
    }

    pub fn get(&self, name: &str) -> Result<Option<IndexRecord>> {
        let path = Self::path(name);
        if !self.storage.file_exists(&path) {
            return Ok(None);
        }
        let bytes = storage::read_all(self.storage.as_ref(), &path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Names of every stored index, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .storage
            .list_files()?
            .into_iter()
            .filter_map(|f| {
                f.strip_prefix("index/")
                    .and_then(|n| n.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete_file(&Self::path(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldKind;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_store_and_list() {
        let store = MetaStore::new(Arc::new(MemoryStorage::new(MemoryStorageConfig::default())));
        let mut record = IndexRecord::new("logs", StorageType::Disk, IndexSettings::default());
        record.shards.insert("a".into(), ShardRecord::new("a"));
        store.put(&record).unwrap();
        store
            .put(&IndexRecord::new("books", StorageType::S3, IndexSettings::default()))
            .unwrap();

        assert_eq!(store.list().unwrap(), vec!["books", "logs"]);
        let loaded = store.get("logs").unwrap().unwrap();
        assert_eq!(loaded, record);

        store.delete("logs").unwrap();
        assert!(store.get("logs").unwrap().is_none());
    }

    #[test]
    fn test_mapping_falls_back_to_flat_pairs() {
        let mut record = IndexRecord::new("old", StorageType::Disk, IndexSettings::default());
        record
            .mapping_fields
            .insert("price".to_string(), "numeric".to_string());
        record
            .mapping_fields
            .insert("ok".to_string(), "boolean".to_string());

        let mapping = record.mapping().unwrap();
        assert_eq!(mapping.get("price").unwrap().kind, FieldKind::Numeric);
        assert_eq!(mapping.get("ok").unwrap().kind, FieldKind::Bool);

        record.set_mapping(&mapping).unwrap();
        assert!(record.mappings.is_some());
        assert_eq!(record.mapping().unwrap(), mapping);
    }

    #[test]
    fn test_time_range_skips_empty() {
        let mut shard = ShardRecord::new("a");
        assert_eq!(shard.doc_time_range(), None);
        shard.sub_shards[0].doc_time_min = -200;
        shard.sub_shards[0].doc_time_max = 0;
        shard.sub_shards.push(SubShardRecord::new(1));
        assert_eq!(shard.sub_shards[1].time_range(), None);
        assert_eq!(shard.doc_time_range(), Some((-200, 0)));

        let mut record = IndexRecord::new("logs", StorageType::Disk, IndexSettings::default());
        record.shards.insert("a".into(), shard);
        record.shards.insert("b".into(), ShardRecord::new("b"));
        assert_eq!(record.doc_time_range(), Some((-200, 0)));
    }
}
