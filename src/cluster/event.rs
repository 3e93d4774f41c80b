//! Typed cluster events decoded from metadata store changes.

use crate::cluster::metadata::{
    DISTRIBUTION_PREFIX, INDEX_PREFIX, NODE_PREFIX, NodeInfo, StoreEvent, StoreEventKind, parse_u64,
};
use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodePut(NodeInfo),
    NodeDelete(u64),
    IndexPut { name: String, version: u64 },
    IndexDelete { name: String },
    DistributionPut { index: String, shard: String, node: u64 },
    DistributionDelete { index: String, shard: String },
}

impl ClusterEvent {
    /// Decode a store event. Keys outside the known prefixes yield `None`.
    pub fn from_store(event: &StoreEvent) -> Result<Option<Self>> {
        let key = event.key.as_str();
        let put = event.kind == StoreEventKind::Put;

        if let Some(id) = key.strip_prefix(NODE_PREFIX) {
            return Ok(Some(if put {
                ClusterEvent::NodePut(serde_json::from_slice(&event.value)?)
            } else {
                ClusterEvent::NodeDelete(id.parse().map_err(|_| {
                    TesseraError::placement(format!("invalid node key [{key}]"))
                })?)
            }));
        }
        if let Some(name) = key.strip_prefix(INDEX_PREFIX) {
            let name = name.to_string();
            return Ok(Some(if put {
                ClusterEvent::IndexPut {
                    name,
                    version: parse_u64(key, &event.value)?,
                }
            } else {
                ClusterEvent::IndexDelete { name }
            }));
        }
        if let Some(rest) = key.strip_prefix(DISTRIBUTION_PREFIX) {
            let Some((index, shard)) = rest.split_once('/') else {
                return Err(TesseraError::placement(format!(
                    "invalid distribution key [{key}]"
                )));
            };
            let (index, shard) = (index.to_string(), shard.to_string());
            return Ok(Some(if put {
                ClusterEvent::DistributionPut {
                    index,
                    shard,
                    node: parse_u64(key, &event.value)?,
                }
            } else {
                ClusterEvent::DistributionDelete { index, shard }
            }));
        }
        Ok(None)
    }

    /// Index the event concerns, if any.
    pub fn index(&self) -> Option<&str> {
        match self {
            ClusterEvent::IndexPut { name, .. } | ClusterEvent::IndexDelete { name } => Some(name),
            ClusterEvent::DistributionPut { index, .. }
            | ClusterEvent::DistributionDelete { index, .. } => Some(index),
            ClusterEvent::NodePut(_) | ClusterEvent::NodeDelete(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: StoreEventKind, key: &str, value: &[u8]) -> StoreEvent {
        StoreEvent {
            kind,
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_decode() {
        let put = event(StoreEventKind::Put, "distribution/logs/abc", b"3");
        assert_eq!(
            ClusterEvent::from_store(&put).unwrap(),
            Some(ClusterEvent::DistributionPut {
                index: "logs".into(),
                shard: "abc".into(),
                node: 3
            })
        );
        let del = event(StoreEventKind::Delete, "node/7", b"{}");
        assert_eq!(
            ClusterEvent::from_store(&del).unwrap(),
            Some(ClusterEvent::NodeDelete(7))
        );
        let idx = event(StoreEventKind::Put, "index/logs", b"12");
        let decoded = ClusterEvent::from_store(&idx).unwrap().unwrap();
        assert_eq!(decoded.index(), Some("logs"));
        assert_eq!(
            ClusterEvent::from_store(&event(StoreEventKind::Put, "meta/nodes", b"")).unwrap(),
            None
        );
        assert!(ClusterEvent::from_store(&event(StoreEventKind::Put, "index/logs", b"x")).is_err());
    }
}
