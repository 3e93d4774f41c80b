//! Cluster metadata store.
//!
//! [`MetadataStore`] is the key-value contract the placement logic needs: get,
//! put, delete, prefix listing, prefix watches delivered in commit order, and
//! named locks with a timeout. [`MemoryMetadataStore`] implements it in
//! process and can be shared by several engines to simulate a cluster.
//!
//! Key layout:
//!
//! | key | value |
//! |---|---|
//! | `node/{id}` | [`NodeInfo`] as JSON |
//! | `index/{name}` | index version |
//! | `distribution/{index}/{shard}` | owning node id |

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, TesseraError};

pub const NODE_PREFIX: &str = "node/";
pub const INDEX_PREFIX: &str = "index/";
pub const DISTRIBUTION_PREFIX: &str = "distribution/";
pub const NODES_LOCK: &str = "meta/nodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// One committed change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// New value for puts, previous value for deletes.
    pub value: Vec<u8>,
}

/// Held distributed lock. Dropping it releases the lock.
pub trait LockGuard: Send + Debug {}

#[async_trait]
pub trait MetadataStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every `(key, value)` under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Changes under `prefix` from now on, in commit order.
    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent>;

    async fn lock(&self, key: &str, timeout: Duration) -> Result<Box<dyn LockGuard>>;
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    watchers: Vec<(String, mpsc::UnboundedSender<StoreEvent>)>,
}

impl Inner {
    fn notify(&mut self, event: StoreEvent) {
        self.watchers.retain(|(prefix, tx)| {
            !event.key.starts_with(prefix.as_str()) || tx.send(event.clone()).is_ok()
        });
    }
}

/// In-process metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    unavailable: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TesseraError::placement("metadata store unavailable"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryLockGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl LockGuard for MemoryLockGuard {}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.inner.lock().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.data.insert(key.to_string(), value.clone());
        inner.notify(StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        if let Some(value) = inner.data.remove(key) {
            inner.notify(StoreEvent {
                kind: StoreEventKind::Delete,
                key: key.to_string(),
                value,
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push((prefix.to_string(), tx));
        rx
    }

    async fn lock(&self, key: &str, timeout: Duration) -> Result<Box<dyn LockGuard>> {
        self.check()?;
        let mutex = self.locks.lock().entry(key.to_string()).or_default().clone();
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| TesseraError::placement(format!("timed out waiting for lock [{key}]")))?;
        Ok(Box::new(MemoryLockGuard { _guard: guard }))
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub name: String,
    pub joined_at: DateTime<Utc>,
}

/// Typed helpers over a [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    store: Arc<dyn MetadataStore>,
}

impl ClusterMetadata {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        ClusterMetadata { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.store.watch(prefix)
    }

    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<Box<dyn LockGuard>> {
        self.store.lock(key, timeout).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.store
            .list(NODE_PREFIX)
            .await?
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_slice(&value)?))
            .collect()
    }

    /// Register a node under the lowest free id, starting from 1.
    pub async fn join(&self, name: &str, timeout: Duration) -> Result<NodeInfo> {
        let _lock = self.lock(NODES_LOCK, timeout).await?;
        let mut ids: Vec<u64> = self.list_nodes().await?.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        let mut id = 1;
        for taken in ids {
            if taken == id {
                id += 1;
            } else if taken > id {
                break;
            }
        }
        let node = NodeInfo {
            id,
            name: name.to_string(),
            joined_at: Utc::now(),
        };
        self.store
            .put(&format!("{NODE_PREFIX}{id}"), serde_json::to_vec(&node)?)
            .await?;
        Ok(node)
    }

    pub async fn leave(&self, node_id: u64) -> Result<()> {
        self.store.delete(&format!("{NODE_PREFIX}{node_id}")).await
    }

    /// Published index versions by name.
    pub async fn list_indexes(&self) -> Result<BTreeMap<String, u64>> {
        self.store
            .list(INDEX_PREFIX)
            .await?
            .into_iter()
            .map(|(key, value)| {
                let name = key[INDEX_PREFIX.len()..].to_string();
                Ok((name, parse_u64(&key, &value)?))
            })
            .collect()
    }

    pub async fn set_index(&self, name: &str, version: u64) -> Result<()> {
        self.store
            .put(&format!("{INDEX_PREFIX}{name}"), version.to_string().into_bytes())
            .await
    }

    /// Remove the index key, then its whole distribution map.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        self.store.delete(&format!("{INDEX_PREFIX}{name}")).await?;
        for shard in self.list_distribution(name).await?.into_keys() {
            self.release_distribute(name, &shard).await?;
        }
        Ok(())
    }

    /// `shard -> node` for one index.
    pub async fn list_distribution(&self, index: &str) -> Result<BTreeMap<String, u64>> {
        let prefix = format!("{DISTRIBUTION_PREFIX}{index}/");
        self.store
            .list(&prefix)
            .await?
            .into_iter()
            .map(|(key, value)| {
                let shard = key[prefix.len()..].to_string();
                Ok((shard, parse_u64(&key, &value)?))
            })
            .collect()
    }

    pub async fn shard_distribute(&self, index: &str, shard: &str, node_id: u64) -> Result<()> {
        self.store
            .put(
                &format!("{DISTRIBUTION_PREFIX}{index}/{shard}"),
                node_id.to_string().into_bytes(),
            )
            .await
    }

    pub async fn release_distribute(&self, index: &str, shard: &str) -> Result<()> {
        self.store
            .delete(&format!("{DISTRIBUTION_PREFIX}{index}/{shard}"))
            .await
    }
}

pub(crate) fn parse_u64(key: &str, value: &[u8]) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| TesseraError::placement(format!("invalid value under [{key}]")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> (Arc<MemoryMetadataStore>, ClusterMetadata) {
        let store = Arc::new(MemoryMetadataStore::new());
        (store.clone(), ClusterMetadata::new(store))
    }

    #[tokio::test]
    async fn test_join_takes_lowest_free_id() {
        let (_, meta) = metadata();
        let timeout = Duration::from_secs(1);
        assert_eq!(meta.join("a", timeout).await.unwrap().id, 1);
        assert_eq!(meta.join("b", timeout).await.unwrap().id, 2);
        assert_eq!(meta.join("c", timeout).await.unwrap().id, 3);
        meta.leave(2).await.unwrap();
        assert_eq!(meta.join("d", timeout).await.unwrap().id, 2);
        let names: Vec<String> = meta.list_nodes().await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["a", "d", "c"]);
    }

    #[tokio::test]
    async fn test_watch_delivers_in_order() {
        let (_, meta) = metadata();
        let mut rx = meta.watch(DISTRIBUTION_PREFIX);
        meta.shard_distribute("logs", "s1", 1).await.unwrap();
        meta.shard_distribute("logs", "s1", 2).await.unwrap();
        meta.set_index("logs", 3).await.unwrap();
        meta.delete_index("logs").await.unwrap();

        let kinds: Vec<(StoreEventKind, Vec<u8>)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| (e.kind, e.value))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (StoreEventKind::Put, b"1".to_vec()),
                (StoreEventKind::Put, b"2".to_vec()),
                (StoreEventKind::Delete, b"2".to_vec()),
            ]
        );
        assert!(meta.list_indexes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_times_out_and_outage_is_placement_error() {
        let (store, meta) = metadata();
        let held = meta.lock("distribution/logs", Duration::from_secs(1)).await.unwrap();
        let err = meta
            .lock("distribution/logs", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Placement);
        drop(held);
        assert!(meta.lock("distribution/logs", Duration::from_millis(20)).await.is_ok());

        store.set_unavailable(true);
        let err = meta.list_nodes().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
