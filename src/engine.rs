use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cluster::metadata::MetadataStore;
use crate::cluster::{Cluster, ClusterWatch};
use crate::config::EngineConfig;
use crate::error::{Result, TesseraError};
use crate::index::{Index, IndexFactory};
use crate::mapping::Mapping;
use crate::meta::{IndexSettings, StorageType};
use crate::registry::{IndexRegistry, WalRegistry};
use crate::scheduler::{TickReport, WalScheduler};
use crate::segment::{MemorySegmentStore, SegmentRegistry};
use crate::storage::file::FileStorageConfig;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Ingestion engine.
///
/// Owns the index and WAL registries, the WAL scheduler and, in cluster mode,
/// the placement state machine. Documents are accepted once their WAL append
/// is durable and become visible in segments after the next scheduler tick.
#[derive(Debug)]
pub struct Engine {
    config: Arc<EngineConfig>,
    storage: Arc<dyn Storage>,
    segments: Arc<SegmentRegistry>,
    registry: Arc<IndexRegistry>,
    factory: IndexFactory,
    scheduler: Arc<WalScheduler>,
    cluster: Option<Arc<Cluster>>,
    watch: Mutex<Option<ClusterWatch>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open a standalone engine over files under `config.data_path`.
    ///
    /// Segments of [`StorageType::Disk`] indexes are kept by the in-process
    /// segment store.
    pub fn open(config: EngineConfig) -> Result<Self> {
        if config.cluster.enabled {
            return Err(TesseraError::invalid_argument(
                "cluster mode needs a metadata store, use Engine::with_parts",
            ));
        }
        let storage = StorageFactory::create(StorageConfig::File(FileStorageConfig::new(
            &config.data_path,
        )))?;
        let segments = Arc::new(SegmentRegistry::new());
        segments.register(StorageType::Disk, Arc::new(MemorySegmentStore::new()));
        Self::with_parts(config, storage, segments, None)
    }

    /// Assemble an engine from explicit backends.
    ///
    /// Standalone engines load and serve every persisted index. Cluster
    /// engines load nothing until [`join`](Self::join).
    pub fn with_parts(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        segments: Arc<SegmentRegistry>,
        metadata: Option<Arc<dyn MetadataStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(IndexRegistry::new());
        let wals = Arc::new(WalRegistry::new());
        let factory = IndexFactory::new(
            storage.clone(),
            segments.clone(),
            config.clone(),
            wals.clone(),
        );
        let scheduler = Arc::new(WalScheduler::new(wals, &config)?);

        let (cluster, watch) = match (config.cluster.enabled, metadata) {
            (true, Some(store)) => {
                let name = format!("node-{}", config.node_id);
                let cluster = Arc::new(Cluster::new(
                    name,
                    store,
                    registry.clone(),
                    factory.clone(),
                    &config,
                )?);
                let watch = cluster.watch();
                (Some(cluster), Some(watch))
            }
            (true, None) => {
                return Err(TesseraError::invalid_argument(
                    "cluster mode needs a metadata store",
                ));
            }
            (false, _) => {
                for name in factory.list()? {
                    let index = factory.load(&name, true)?;
                    registry.add(index);
                }
                if !registry.list().is_empty() {
                    info!("loaded {} indexes", registry.list().len());
                }
                (None, None)
            }
        };

        Ok(Engine {
            config,
            storage,
            segments,
            registry,
            factory,
            scheduler,
            cluster,
            watch: Mutex::new(watch),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn segments(&self) -> &Arc<SegmentRegistry> {
        &self.segments
    }

    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    /// Join the cluster. A no-op for standalone engines.
    pub async fn join(&self) -> Result<()> {
        if let Some(cluster) = &self.cluster {
            cluster.join().await?;
        }
        Ok(())
    }

    /// Start the WAL scheduler and, in cluster mode, the event watchers.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.scheduler.spawn());
        if let (Some(cluster), Some(watch)) = (&self.cluster, self.watch.lock().take()) {
            tasks.extend(watch.spawn(cluster.clone()));
        }
    }

    /// Handle every queued cluster event. Only useful before
    /// [`start`](Self::start); afterwards the watchers own the streams.
    pub async fn pump_cluster(&self) -> usize {
        let (Some(cluster), Some(mut watch)) = (&self.cluster, self.watch.lock().take()) else {
            return 0;
        };
        let handled = watch.drain(cluster).await;
        *self.watch.lock() = Some(watch);
        handled
    }

    pub async fn create_index(
        &self,
        name: &str,
        storage_type: StorageType,
        settings: Option<IndexSettings>,
        mapping: Option<&Mapping>,
    ) -> Result<Arc<Index>> {
        match &self.cluster {
            Some(cluster) => {
                cluster
                    .create_index(name, storage_type, settings, mapping)
                    .await
            }
            None => {
                let index = self
                    .factory
                    .create(name, storage_type, settings, mapping, true)?;
                self.registry.add(index.clone());
                Ok(index)
            }
        }
    }

    pub async fn delete_index(&self, name: &str) -> Result<()> {
        match &self.cluster {
            Some(cluster) => cluster.delete_index(name).await,
            None => {
                let index = self
                    .registry
                    .remove(name)
                    .ok_or_else(|| TesseraError::not_found(format!("index [{name}]")))?;
                self.factory.delete(&index)
            }
        }
    }

    pub fn index(&self, name: &str) -> Result<Arc<Index>> {
        self.registry
            .get(name)
            .ok_or_else(|| TesseraError::not_found(format!("index [{name}]")))
    }

    pub fn list_indexes(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Submit an insert. Returns the document id.
    pub fn insert(&self, index: &str, body: &Value) -> Result<String> {
        self.index(index)?.insert(body)
    }

    pub fn update(&self, index: &str, doc_id: &str, body: &Value) -> Result<String> {
        self.index(index)?.update(doc_id, body)
    }

    pub fn delete(&self, index: &str, doc_id: &str) -> Result<String> {
        self.index(index)?.delete(doc_id)
    }

    /// Run one scheduler tick now.
    pub async fn flush(&self) -> TickReport {
        self.scheduler.tick().await
    }

    /// Stop background work, drain the WALs once and give up local shards.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("background task failed: {e}");
                }
            }
        }
        self.flush().await;
        match &self.cluster {
            Some(cluster) => cluster.leave().await?,
            None => {
                for index in self.registry.all() {
                    index.close()?;
                }
            }
        }
        info!("engine shut down");
        Ok(())
    }
}
