//! # Tessera
//!
//! Durable, shardable document ingestion core for a multi-tenant search
//! engine.
//!
//! ## Features
//!
//! - Dynamic mapping inference with monotonic, validated schema growth
//! - Per-shard write-ahead log with a redo log for exactly-once application
//! - Batched WAL consumption that folds repeated writes per document
//! - Size-based sub-shard rolling with time-range read pruning
//! - Fair shard placement across cluster nodes

pub mod cluster;
pub mod config;
pub mod data;
mod engine;
pub mod error;
pub mod index;
pub mod mapping;
pub mod merge;
pub mod meta;
pub mod registry;
pub mod scheduler;
pub mod segment;
pub mod shard;
pub mod storage;
pub mod wal;

pub use cluster::Cluster;
pub use cluster::metadata::{MemoryMetadataStore, MetadataStore};
pub use config::EngineConfig;
pub use data::{DataValue, Source};
pub use engine::Engine;
pub use error::{ErrorKind, Result, TesseraError};
pub use index::{Index, IndexFactory};
pub use mapping::{FieldKind, Mapping, Property};
pub use meta::{IndexSettings, StorageType};
pub use segment::{MemorySegmentStore, SegmentRegistry, SegmentStore};
pub use shard::{IndexShard, ShardReader};
pub use storage::{Storage, StorageConfig, StorageFactory};
pub use wal::{Action, ShardTarget, WalEntry};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
