//! Cluster shard placement.
//!
//! Every node watches three prefixes of the metadata store (nodes, index
//! versions, shard distribution) and keeps local caches of each. Placement
//! decisions are driven by those events:
//!
//! - a node joining makes every other node release shards above its fair
//!   share;
//! - a node leaving, or a shard being released, makes every node try to claim
//!   unowned shards up to its fair share;
//! - a new index version is loaded or hot-reloaded in place.
//!
//! The distribution map in the metadata store is authoritative. Claims happen
//! under the per-index lock `distribution/{index}`.
//!
//! # Fair share
//!
//! With `S` shards and `N` live nodes every node gets `S / N` shards and the
//! first `S % N` nodes, ordered by shards already owned (descending) then id,
//! get one more. The quotas sum to `S`, so once every node is at or below its
//! quota and nothing is unowned, shard counts differ by at most one.

pub mod event;
pub mod metadata;
pub mod ring;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{Result, TesseraError};
use crate::index::{Index, IndexFactory};
use crate::mapping::Mapping;
use crate::meta::{IndexSettings, StorageType};
use crate::registry::IndexRegistry;

use self::event::ClusterEvent;
use self::metadata::{
    ClusterMetadata, DISTRIBUTION_PREFIX, INDEX_PREFIX, MetadataStore, NODE_PREFIX, NodeInfo,
    StoreEvent,
};
use self::ring::Rendezvous;

/// `round(total / nodes)`.
pub fn fair_share(total: usize, nodes: usize) -> usize {
    if nodes == 0 {
        return total;
    }
    (2 * total + nodes) / (2 * nodes)
}

/// Exact quota per node for `total` shards given what each node owns now.
pub fn fair_quotas(total: usize, owned: &BTreeMap<u64, usize>) -> BTreeMap<u64, usize> {
    let nodes = owned.len();
    if nodes == 0 {
        return BTreeMap::new();
    }
    let (base, rem) = (total / nodes, total % nodes);
    let mut order: Vec<(u64, usize)> = owned.iter().map(|(id, n)| (*id, *n)).collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    order
        .into_iter()
        .enumerate()
        .map(|(i, (id, _))| (id, base + usize::from(i < rem)))
        .collect()
}

/// Receivers for the three watched prefixes.
#[derive(Debug)]
pub struct ClusterWatch {
    nodes: UnboundedReceiver<StoreEvent>,
    indexes: UnboundedReceiver<StoreEvent>,
    distribution: UnboundedReceiver<StoreEvent>,
}

impl ClusterWatch {
    /// Handle every queued event until all three streams are empty. Returns
    /// the number of events handled.
    pub async fn drain(&mut self, cluster: &Cluster) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for rx in [&mut self.nodes, &mut self.indexes, &mut self.distribution] {
                while let Ok(event) = rx.try_recv() {
                    cluster.handle_store_event(event).await;
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// One long-lived task per stream.
    pub fn spawn(self, cluster: Arc<Cluster>) -> Vec<JoinHandle<()>> {
        [self.nodes, self.indexes, self.distribution]
            .into_iter()
            .map(|mut rx| {
                let cluster = cluster.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        cluster.handle_store_event(event).await;
                    }
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct Cluster {
    node_id: AtomicU64,
    node_name: String,
    metadata: ClusterMetadata,
    registry: Arc<IndexRegistry>,
    factory: IndexFactory,
    nodes: RwLock<BTreeMap<u64, NodeInfo>>,
    node_ring: Rendezvous,
    versions: Arc<RwLock<HashMap<String, u64>>>,
    distribution: RwLock<HashMap<String, BTreeMap<String, u64>>>,
    lock_timeout: Duration,
}

impl Cluster {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn MetadataStore>,
        registry: Arc<IndexRegistry>,
        factory: IndexFactory,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Cluster {
            node_id: AtomicU64::new(config.node_id),
            node_name: node_name.into(),
            metadata: ClusterMetadata::new(store),
            registry,
            factory,
            nodes: RwLock::new(BTreeMap::new()),
            node_ring: Rendezvous::default(),
            versions: Arc::new(RwLock::new(HashMap::new())),
            distribution: RwLock::new(HashMap::new()),
            lock_timeout: config.cluster.lock_timeout()?,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// Subscribe to the watched prefixes. Call before [`join`](Self::join)
    /// so no change is missed.
    pub fn watch(&self) -> ClusterWatch {
        ClusterWatch {
            nodes: self.metadata.watch(NODE_PREFIX),
            indexes: self.metadata.watch(INDEX_PREFIX),
            distribution: self.metadata.watch(DISTRIBUTION_PREFIX),
        }
    }

    /// Register this node, load every published index and claim a fair
    /// share of each.
    pub async fn join(&self) -> Result<u64> {
        let node = self.metadata.join(&self.node_name, self.lock_timeout).await?;
        self.node_id.store(node.id, Ordering::SeqCst);
        info!("node [{}] joined as {}", self.node_name, node.id);

        for node in self.metadata.list_nodes().await? {
            self.add_node(node);
        }
        for (name, version) in self.metadata.list_indexes().await? {
            let dist = self.metadata.list_distribution(&name).await?;
            self.distribution.write().insert(name.clone(), dist);
            self.handle_index_put(&name, version).await?;
        }
        Ok(node.id)
    }

    /// Give up every local shard and deregister.
    pub async fn leave(&self) -> Result<()> {
        for index in self.registry.all() {
            for shard in index.local_shard_ids() {
                index.detach_shard(&shard)?;
                self.metadata.release_distribute(index.name(), &shard).await?;
                self.forget_owner(index.name(), &shard);
            }
        }
        self.metadata.leave(self.node_id()).await?;
        info!("node {} left the cluster", self.node_id());
        Ok(())
    }

    fn add_node(&self, node: NodeInfo) -> bool {
        self.node_ring.add(&node.id.to_string());
        self.nodes.write().insert(node.id, node).is_none()
    }

    fn remove_node(&self, id: u64) {
        self.node_ring.remove(&id.to_string());
        self.nodes.write().remove(&id);
    }

    fn live_nodes(&self) -> BTreeSet<u64> {
        let mut live: BTreeSet<u64> = self.nodes.read().keys().copied().collect();
        live.insert(self.node_id());
        live
    }

    fn cached_distribution(&self, index: &str) -> BTreeMap<String, u64> {
        self.distribution.read().get(index).cloned().unwrap_or_default()
    }

    fn remember_owner(&self, index: &str, shard: &str, node: u64) {
        self.distribution
            .write()
            .entry(index.to_string())
            .or_default()
            .insert(shard.to_string(), node);
    }

    fn forget_owner(&self, index: &str, shard: &str) {
        if let Some(dist) = self.distribution.write().get_mut(index) {
            dist.remove(shard);
        }
    }

    /// Whether this node prefers to own `shard`.
    fn prefers(&self, shard: &str) -> bool {
        self.node_ring.lookup(shard) == Some(self.node_id().to_string())
    }

    /// Cached `index -> shard -> node` map.
    pub fn distribution(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.distribution
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    async fn handle_store_event(&self, event: StoreEvent) {
        let result = match ClusterEvent::from_store(&event) {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("node {} abandoned event [{}]: {e}", self.node_id(), event.key);
        }
    }

    pub async fn handle_event(&self, event: ClusterEvent) -> Result<()> {
        debug!("node {} cluster event {event:?}", self.node_id());
        match event {
            ClusterEvent::NodePut(node) => {
                let id = node.id;
                if self.add_node(node) && id != self.node_id() {
                    self.release_node_shards().await?;
                }
            }
            ClusterEvent::NodeDelete(id) => {
                self.remove_node(id);
                if id != self.node_id() {
                    for name in self.registry.list() {
                        self.distribute_index_shards(&name).await?;
                    }
                }
            }
            ClusterEvent::IndexPut { name, version } => {
                self.handle_index_put(&name, version).await?;
            }
            ClusterEvent::IndexDelete { name } => {
                self.versions.write().remove(&name);
                self.distribution.write().remove(&name);
                if let Some(index) = self.registry.remove(&name) {
                    index.close()?;
                    info!("node {} evicted deleted index [{name}]", self.node_id());
                }
            }
            ClusterEvent::DistributionPut { index, shard, node } => {
                self.remember_owner(&index, &shard, node);
                if node != self.node_id() {
                    if let Some(local) = self.registry.get(&index) {
                        local.detach_shard(&shard)?;
                    }
                }
            }
            ClusterEvent::DistributionDelete { index, shard } => {
                self.forget_owner(&index, &shard);
                if self.registry.contains(&index) {
                    self.distribute_index_shards(&index).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_index_put(&self, name: &str, version: u64) -> Result<()> {
        match self.registry.get(name) {
            None => {
                let index = self.factory.load(name, false)?;
                info!("node {} loaded index [{name}] at version {version}", self.node_id());
                self.versions.write().insert(name.to_string(), index.version());
                self.registry.add(index.clone());
                self.track_index(&index);
                self.distribute_index_shards(name).await?;
            }
            Some(index) => {
                let known = self.versions.read().get(name).copied();
                if known != Some(version) {
                    if let Some(record) = self.factory.meta().get(name)? {
                        index.reload(record)?;
                    }
                    self.versions.write().insert(name.to_string(), version);
                }
            }
        }
        Ok(())
    }

    /// Publish version bumps made on this node.
    fn track_index(&self, index: &Arc<Index>) {
        let mut rx = index.subscribe_version();
        let name = index.name().to_string();
        let metadata = self.metadata.clone();
        let versions = self.versions.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let version = *rx.borrow_and_update();
                versions.write().insert(name.clone(), version);
                if let Err(e) = metadata.set_index(&name, version).await {
                    warn!("failed to publish index [{name}] version {version}: {e}");
                }
            }
        });
    }

    /// Create an index and claim a fair share of its shards.
    pub async fn create_index(
        &self,
        name: &str,
        storage_type: StorageType,
        settings: Option<IndexSettings>,
        mapping: Option<&Mapping>,
    ) -> Result<Arc<Index>> {
        let index = self
            .factory
            .create(name, storage_type, settings, mapping, false)?;
        let version = index.version();
        self.versions.write().insert(name.to_string(), version);
        self.registry.add(index.clone());
        self.track_index(&index);
        self.metadata.set_index(name, version).await?;
        self.distribute_index_shards(name).await?;
        Ok(index)
    }

    /// Delete an index cluster-wide.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        let index = self
            .registry
            .remove(name)
            .ok_or_else(|| TesseraError::not_found(format!("index [{name}]")))?;
        self.versions.write().remove(name);
        self.distribution.write().remove(name);
        self.factory.delete(&index)?;
        self.metadata.delete_index(name).await
    }

    /// Claim unowned shards of `name` up to this node's fair share.
    ///
    /// Creates a new shard when this node would otherwise serve none.
    /// Returns the number of shards claimed.
    pub async fn distribute_index_shards(&self, name: &str) -> Result<usize> {
        let Some(index) = self.registry.get(name) else {
            return Ok(0);
        };
        let me = self.node_id();

        let live = self.live_nodes();
        let shards = index.shard_ids();
        let local = index.local_shard_ids().len();
        let cached = self.cached_distribution(name);
        let has_orphans = shards
            .iter()
            .any(|s| cached.get(s).is_none_or(|node| !live.contains(node)));
        if local >= fair_share(shards.len(), live.len())
            && local >= 1
            && (!has_orphans || local > shards.len() / live.len())
        {
            return Ok(0);
        }

        let _lock = self
            .metadata
            .lock(&format!("{DISTRIBUTION_PREFIX}{name}"), self.lock_timeout)
            .await?;
        let Some(record) = self.factory.meta().get(name)? else {
            return Ok(0);
        };
        index.reload(record)?;
        let dist = self.metadata.list_distribution(name).await?;
        let shards = index.shard_ids();
        let live = self.live_nodes();

        let mut owned: BTreeMap<u64, usize> = live.iter().map(|n| (*n, 0)).collect();
        let mut mine: Vec<String> = Vec::new();
        let mut orphans: Vec<String> = Vec::new();
        for shard in &shards {
            match dist.get(shard) {
                Some(node) if live.contains(node) => {
                    *owned.entry(*node).or_default() += 1;
                    if *node == me {
                        mine.push(shard.clone());
                    }
                }
                _ => orphans.push(shard.clone()),
            }
        }
        let quota = fair_quotas(shards.len(), &owned)
            .get(&me)
            .copied()
            .unwrap_or(0);
        orphans.sort_by_key(|s| !self.prefers(s));

        let mut claimed = 0;
        for shard in orphans.into_iter().take(quota.saturating_sub(mine.len())) {
            self.metadata.shard_distribute(name, &shard, me).await?;
            self.remember_owner(name, &shard, me);
            mine.push(shard);
            claimed += 1;
        }
        if mine.is_empty() {
            let shard = index.create_shard()?;
            self.metadata.shard_distribute(name, &shard, me).await?;
            self.remember_owner(name, &shard, me);
            self.versions.write().insert(name.to_string(), index.version());
            self.metadata.set_index(name, index.version()).await?;
            mine.push(shard);
            claimed += 1;
        }

        for shard in &mine {
            index.attach_shard(shard)?;
        }
        for shard in index.local_shard_ids() {
            if !mine.contains(&shard) {
                index.detach_shard(&shard)?;
            }
        }
        for (shard, node) in dist {
            if node != me {
                self.remember_owner(name, &shard, node);
            }
        }
        if claimed > 0 {
            info!(
                "node {me} claimed {claimed} shards of index [{name}], now serving {}",
                mine.len()
            );
        }
        Ok(claimed)
    }

    /// Release shards of `name` above this node's fair share. Returns the
    /// number released.
    pub async fn release_index_shards(&self, name: &str) -> Result<usize> {
        let Some(index) = self.registry.get(name) else {
            return Ok(0);
        };
        let me = self.node_id();
        let live = self.live_nodes();
        let cached = self.cached_distribution(name);
        let shards = index.shard_ids();
        let mut local = index.local_shard_ids();

        let mut owned: BTreeMap<u64, usize> = live.iter().map(|n| (*n, 0)).collect();
        for shard in &shards {
            if let Some(node) = cached.get(shard).filter(|n| **n != me && live.contains(*n)) {
                *owned.entry(*node).or_default() += 1;
            }
        }
        owned.insert(me, local.len());
        let quota = fair_quotas(shards.len(), &owned)
            .get(&me)
            .copied()
            .unwrap_or(0);
        if local.len() <= quota {
            return Ok(0);
        }

        let excess = local.len() - quota;
        local.sort_by_key(|s| self.prefers(s));
        for shard in local.iter().take(excess) {
            index.detach_shard(shard)?;
            self.metadata.release_distribute(name, shard).await?;
            self.forget_owner(name, shard);
        }
        info!("node {me} released {excess} shards of index [{name}]");
        Ok(excess)
    }

    /// Release excess shards of every known index.
    pub async fn release_node_shards(&self) -> Result<usize> {
        let names: Vec<String> = self.versions.read().keys().cloned().collect();
        let mut released = 0;
        for name in names {
            released += self.release_index_shards(&name).await?;
        }
        Ok(released)
    }
}
