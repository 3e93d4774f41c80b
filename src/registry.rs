//! Open indexes and open shard WALs.
//!
//! Both registries are plain services handed to whoever needs them, so several
//! engines can live in one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::index::Index;
use crate::shard::IndexShard;

#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<String, Arc<Index>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index, returning the one it replaced.
    pub fn add(&self, index: Arc<Index>) -> Option<Arc<Index>> {
        self.indexes.write().insert(index.name().to_string(), index)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.read().contains_key(name)
    }

    /// Index names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }
}

/// Shard WALs the scheduler drains, keyed by `"{index}/{shard}"`.
#[derive(Debug, Default)]
pub struct WalRegistry {
    wals: RwLock<HashMap<String, Arc<IndexShard>>>,
}

impl WalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, shard: Arc<IndexShard>) {
        self.wals.write().insert(shard.key(), shard);
    }

    pub fn get(&self, key: &str) -> Option<Arc<IndexShard>> {
        self.wals.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<IndexShard>> {
        self.wals.write().remove(key)
    }

    pub fn list(&self) -> Vec<Arc<IndexShard>> {
        let mut shards: Vec<Arc<IndexShard>> = self.wals.read().values().cloned().collect();
        shards.sort_by_key(|s| s.key());
        shards
    }

    pub fn len(&self) -> usize {
        self.wals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop closed shards and return how many were evicted.
    pub fn evict_closed(&self) -> usize {
        let mut wals = self.wals.write();
        let before = wals.len();
        wals.retain(|_, shard| !shard.is_closed());
        before - wals.len()
    }
}
