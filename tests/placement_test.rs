use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use tessera::storage::memory::{MemoryStorage, MemoryStorageConfig};
use tessera::{
    Engine, EngineConfig, IndexSettings, MemoryMetadataStore, MemorySegmentStore, MetadataStore,
    SegmentRegistry, Storage, StorageType,
};

struct Cluster {
    storage: Arc<dyn Storage>,
    segments: Arc<SegmentRegistry>,
    meta: Arc<MemoryMetadataStore>,
    nodes: Vec<Engine>,
    rng: StdRng,
}

impl Cluster {
    fn new(seed: u64) -> Self {
        let segments = Arc::new(SegmentRegistry::new());
        segments.register(StorageType::Disk, Arc::new(MemorySegmentStore::new()));
        Cluster {
            storage: Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
            segments,
            meta: Arc::new(MemoryMetadataStore::new()),
            nodes: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    async fn join(&mut self) -> tessera::Result<usize> {
        let config = EngineConfig::builder()
            .node_id(self.nodes.len() as u64 + 1)
            .cluster(true)
            .build()?;
        let meta: Arc<dyn MetadataStore> = self.meta.clone();
        let engine = Engine::with_parts(
            config,
            self.storage.clone(),
            self.segments.clone(),
            Some(meta),
        )?;
        engine.join().await?;
        self.nodes.push(engine);
        self.settle().await;
        Ok(self.nodes.len() - 1)
    }

    /// Deliver events until every node is quiet.
    async fn settle(&mut self) {
        let mut quiet = 0;
        for _ in 0..500 {
            let mut order: Vec<usize> = (0..self.nodes.len()).collect();
            order.shuffle(&mut self.rng);
            let mut handled = 0;
            for i in order {
                handled += self.nodes[i].pump_cluster().await;
            }
            tokio::task::yield_now().await;
            quiet = if handled == 0 { quiet + 1 } else { 0 };
            if quiet >= 3 {
                return;
            }
        }
        panic!("cluster did not settle");
    }

    fn local_counts(&self, index: &str) -> tessera::Result<Vec<usize>> {
        self.nodes
            .iter()
            .map(|n| Ok(n.index(index)?.local_shard_ids().len()))
            .collect()
    }

    /// Every shard is served by exactly one node, the one the distribution
    /// map names.
    async fn assert_consistent(&self, index: &str) -> tessera::Result<()> {
        let first = self.nodes[0].cluster().unwrap();
        let distribution = first.metadata().list_distribution(index).await?;
        let all: BTreeSet<String> = self.nodes[0].index(index)?.shard_ids().into_iter().collect();
        assert_eq!(distribution.keys().cloned().collect::<BTreeSet<_>>(), all);

        let mut served: BTreeMap<String, u64> = BTreeMap::new();
        for node in &self.nodes {
            let id = node.cluster().unwrap().node_id();
            for shard in node.index(index)?.local_shard_ids() {
                assert!(served.insert(shard, id).is_none(), "shard served twice");
            }
        }
        assert_eq!(served, distribution);
        Ok(())
    }

    fn assert_balanced(&self, index: &str) -> tessera::Result<()> {
        let counts = self.local_counts(index)?;
        let max = counts.iter().max().copied().unwrap_or(0);
        let min = counts.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced placement {counts:?}");
        assert!(min >= 1, "idle node {counts:?}");
        Ok(())
    }
}

fn shards(n: usize) -> Option<IndexSettings> {
    Some(IndexSettings {
        number_of_shards: n,
        shard_max_size: None,
    })
}

#[tokio::test]
async fn test_nodes_joining_share_shards_fairly() -> tessera::Result<()> {
    // 1. One node owns everything
    let mut cluster = Cluster::new(7);
    cluster.join().await?;
    cluster.nodes[0]
        .create_index("logs", StorageType::Disk, shards(6), None)
        .await?;
    cluster.settle().await;
    assert_eq!(cluster.local_counts("logs")?, vec![6]);

    // 2. Nodes join one by one
    for expected in 2..=4 {
        cluster.join().await?;
        assert_eq!(cluster.nodes.len(), expected);
        cluster.assert_consistent("logs").await?;
        cluster.assert_balanced("logs")?;
    }

    // 3. Node ids are the lowest free ones
    let ids: Vec<u64> = cluster
        .nodes
        .iter()
        .map(|n| n.cluster().unwrap().node_id())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    // 4. Every node accepts writes
    for (i, node) in cluster.nodes.iter().enumerate() {
        node.insert("logs", &json!({"_id": format!("from-{i}"), "n": i}))?;
    }
    Ok(())
}

#[tokio::test]
async fn test_leaving_node_hands_over_its_shards() -> tessera::Result<()> {
    // 1. Three balanced nodes
    let mut cluster = Cluster::new(11);
    cluster.join().await?;
    cluster.nodes[0]
        .create_index("logs", StorageType::Disk, shards(9), None)
        .await?;
    cluster.settle().await;
    cluster.join().await?;
    cluster.join().await?;
    cluster.assert_balanced("logs")?;

    // 2. The last node leaves gracefully
    let leaving = cluster.nodes.pop().unwrap();
    leaving.shutdown().await?;
    cluster.settle().await;

    // 3. The remaining nodes hold every shard
    cluster.assert_consistent("logs").await?;
    cluster.assert_balanced("logs")?;
    assert_eq!(cluster.nodes[0].cluster().unwrap().nodes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_dead_node_shards_are_adopted() -> tessera::Result<()> {
    // 1. Three balanced nodes
    let mut cluster = Cluster::new(3);
    cluster.join().await?;
    cluster.nodes[0]
        .create_index("logs", StorageType::Disk, shards(5), None)
        .await?;
    cluster.settle().await;
    cluster.join().await?;
    cluster.join().await?;

    // 2. Node 3 disappears without releasing anything
    let dead = cluster.nodes.pop().unwrap();
    let dead_id = dead.cluster().unwrap().node_id();
    cluster.meta.delete(&format!("node/{dead_id}")).await?;
    cluster.settle().await;

    // 3. Its shards are claimed by the survivors
    cluster.assert_consistent("logs").await?;
    cluster.assert_balanced("logs")?;
    Ok(())
}

#[tokio::test]
async fn test_index_lifecycle_propagates() -> tessera::Result<()> {
    // 1. Two nodes
    let mut cluster = Cluster::new(5);
    cluster.join().await?;
    cluster.join().await?;

    // 2. An index created on node 2 is loaded by node 1
    cluster.nodes[1]
        .create_index("metrics", StorageType::Disk, shards(4), None)
        .await?;
    cluster.settle().await;
    assert_eq!(cluster.nodes[0].list_indexes(), vec!["metrics"]);
    cluster.assert_consistent("metrics").await?;
    cluster.assert_balanced("metrics")?;

    // 3. Mapping changes on one node reach the other
    let writer = cluster
        .nodes
        .iter()
        .position(|n| {
            n.index("metrics")
                .map(|i| !i.local_shard_ids().is_empty())
                .unwrap_or(false)
        })
        .unwrap();
    cluster.nodes[writer].insert("metrics", &json!({"cpu": 0.5, "host": "a"}))?;
    cluster.settle().await;
    let version = cluster.nodes[writer].index("metrics")?.version();
    for node in &cluster.nodes {
        let index = node.index("metrics")?;
        assert_eq!(index.version(), version);
        assert!(index.mapping().get("cpu").is_some());
    }

    // 4. Deleting on node 1 removes it everywhere
    cluster.nodes[0].delete_index("metrics").await?;
    cluster.settle().await;
    for node in &cluster.nodes {
        assert!(node.list_indexes().is_empty());
    }
    let distribution = cluster.nodes[1]
        .cluster()
        .unwrap()
        .metadata()
        .list_distribution("metrics")
        .await?;
    assert!(distribution.is_empty());
    Ok(())
}
