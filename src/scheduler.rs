//! Periodic WAL consumption.
//!
//! Every tick evicts closed shards from the [`WalRegistry`] and drains the
//! rest, at most `shard.concurrency` at a time. Consumption runs on the
//! blocking pool since it does synchronous I/O. Failures are logged and
//! retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, error};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::error::{Result, TesseraError};
use crate::registry::WalRegistry;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub shards: usize,
    pub entries: u64,
    pub rolled: usize,
    pub failures: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct WalScheduler {
    wals: Arc<WalRegistry>,
    interval: Duration,
    concurrency: usize,
    shutdown: Notify,
}

impl WalScheduler {
    pub fn new(wals: Arc<WalRegistry>, config: &EngineConfig) -> Result<Self> {
        Ok(WalScheduler {
            wals,
            interval: config.wal.sync_interval()?,
            concurrency: config.shard.concurrency.max(1),
            shutdown: Notify::new(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Drain every open WAL once.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            evicted: self.wals.evict_closed(),
            ..Default::default()
        };
        let shards = self.wals.list();
        report.shards = shards.len();

        let results: Vec<_> = stream::iter(shards)
            .map(|shard| async move {
                let key = shard.key();
                let result = tokio::task::spawn_blocking(move || shard.consume())
                    .await
                    .unwrap_or_else(|e| Err(TesseraError::internal(format!("consume task: {e}"))));
                (key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(stats) => {
                    report.entries += stats.entries;
                    report.rolled += stats.rolled as usize;
                }
                Err(e) => {
                    report.failures += 1;
                    error!("shard [{key}] consumption failed: {e}");
                }
            }
        }
        if report.entries > 0 || report.failures > 0 {
            debug!("wal tick {report:?}");
        }
        report
    }

    /// Run ticks on the configured interval until [`shutdown`](Self::shutdown).
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                    _ = scheduler.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexFactory;
    use crate::meta::{IndexSettings, StorageType};
    use crate::segment::{MemorySegmentStore, SegmentRegistry};
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_tick_drains_and_evicts() {
        let config = EngineConfig::builder().sync_interval("10ms").build().unwrap();
        let store = Arc::new(MemorySegmentStore::new());
        let segments = Arc::new(SegmentRegistry::new());
        segments.register(StorageType::Disk, store.clone());
        let wals = Arc::new(WalRegistry::new());
        let factory = IndexFactory::new(
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
            segments,
            Arc::new(config.clone()),
            wals.clone(),
        );
        let settings = IndexSettings {
            number_of_shards: 2,
            shard_max_size: None,
        };
        let index = factory
            .create("events", StorageType::Disk, Some(settings), None, true)
            .unwrap();
        for i in 0..10 {
            index.insert(&json!({"n": i})).unwrap();
        }

        let scheduler = Arc::new(WalScheduler::new(wals.clone(), &config).unwrap());
        let report = scheduler.tick().await;
        assert_eq!(report.shards, 2);
        assert_eq!(report.entries, 10);
        assert_eq!(report.failures, 0);

        let id = index.local_shard_ids()[0].clone();
        index.detach_shard(&id).unwrap();
        let report = scheduler.tick().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.shards, 1);
        assert_eq!(report.entries, 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let config = EngineConfig::builder().sync_interval("10ms").build().unwrap();
        let scheduler = Arc::new(WalScheduler::new(Arc::new(WalRegistry::new()), &config).unwrap());
        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
