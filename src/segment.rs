//! Contract of the embedded segment library.
//!
//! The inverted-index library is a black box: it opens a writer over a named
//! directory, applies atomic batches of insert/update/delete operations and
//! serves readers. [`MemorySegmentStore`] is an in-process implementation used
//! by default and in tests.

pub mod memory;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::DataValue;
use crate::error::{Result, TesseraError};
use crate::meta::StorageType;

pub use self::memory::MemorySegmentStore;

/// A document as handed to the segment library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDocument {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<(String, DataValue)>,
    /// Original body, stored only.
    pub source: Value,
}

impl SegmentDocument {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        SegmentDocument {
            id: id.into(),
            timestamp,
            fields: Vec::new(),
            source: Value::Null,
        }
    }

    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOp {
    /// Add a document without checking for an existing id.
    Insert(SegmentDocument),
    /// Replace every document with this id.
    Update(SegmentDocument),
    /// Remove every document with this id. Missing ids are a no-op.
    Delete(String),
}

/// Ordered operations applied atomically by [`SegmentWriter::batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentBatch {
    ops: Vec<SegmentOp>,
}

impl SegmentBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, doc: SegmentDocument) {
        self.ops.push(SegmentOp::Insert(doc));
    }

    pub fn update(&mut self, doc: SegmentDocument) {
        self.ops.push(SegmentOp::Update(doc));
    }

    pub fn delete(&mut self, id: impl Into<String>) {
        self.ops.push(SegmentOp::Delete(id.into()));
    }

    pub fn ops(&self) -> &[SegmentOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Timestamps of documents written by this batch.
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.ops.iter().filter_map(|op| match op {
            SegmentOp::Insert(doc) | SegmentOp::Update(doc) => {
                doc.timestamp.timestamp_nanos_opt()
            }
            SegmentOp::Delete(_) => None,
        })
    }
}

/// Read side of one segment directory.
pub trait SegmentReader: Send + Sync + Debug {
    fn get(&self, doc_id: &str) -> Result<Option<SegmentDocument>>;

    fn contains(&self, doc_id: &str) -> Result<bool> {
        Ok(self.get(doc_id)?.is_some())
    }

    fn doc_count(&self) -> Result<u64>;
}

/// Write side of one segment directory.
pub trait SegmentWriter: Send + Sync + Debug {
    /// Apply every operation or none.
    fn batch(&self, batch: &SegmentBatch) -> Result<()>;

    /// Bytes occupied by the directory.
    fn size(&self) -> Result<u64>;

    fn reader(&self) -> Result<Arc<dyn SegmentReader>>;

    fn close(&self) -> Result<()>;
}

/// Factory for writers and readers over named directories.
pub trait SegmentStore: Send + Sync + Debug {
    fn open_writer(&self, dir: &str) -> Result<Arc<dyn SegmentWriter>>;

    fn open_reader(&self, dir: &str) -> Result<Arc<dyn SegmentReader>>;

    /// Remove the directory and everything in it.
    fn delete_dir(&self, dir: &str) -> Result<()>;
}

/// Segment stores by backend type.
#[derive(Debug, Default)]
pub struct SegmentRegistry {
    stores: RwLock<HashMap<StorageType, Arc<dyn SegmentStore>>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, storage_type: StorageType, store: Arc<dyn SegmentStore>) {
        self.stores.write().insert(storage_type, store);
    }

    pub fn get(&self, storage_type: StorageType) -> Result<Arc<dyn SegmentStore>> {
        self.stores.read().get(&storage_type).cloned().ok_or_else(|| {
            TesseraError::invalid_argument(format!(
                "no segment store registered for storage type [{storage_type}]"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_requires_registration() {
        let registry = SegmentRegistry::new();
        let err = registry.get(StorageType::S3).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        registry.register(StorageType::S3, Arc::new(MemorySegmentStore::new()));
        assert!(registry.get(StorageType::S3).is_ok());
        assert!(registry.get(StorageType::MinIO).is_err());
    }
}
