//! Collapsing WAL entries into segment batches.
//!
//! Entries are grouped by the sub-shard they resolve to, then by document id,
//! keeping the order in which each document's actions arrived. Each document
//! collapses to a single net operation:
//!
//! | first  | last           | net                                |
//! |--------|----------------|------------------------------------|
//! | insert | insert, update | insert                             |
//! | insert | delete         | nothing                            |
//! | update, delete | insert, update | update, delete elsewhere  |
//! | update, delete | delete | delete everywhere                  |
//!
//! A single action is applied as-is; update and delete also remove the
//! document from every other sub-shard.

use std::collections::BTreeMap;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use log::error;

use crate::error::Result;
use crate::mapping::Mapping;
use crate::segment::{SegmentBatch, SegmentDocument};
use crate::wal::{Action, ShardTarget, WalEntry};

/// Net effect of a document's actions within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Insert,
    Update,
    Delete,
    Noop,
}

pub fn resolve(actions: &[Action]) -> Resolved {
    match actions {
        [] => Resolved::Noop,
        [Action::Insert] => Resolved::Insert,
        [Action::Update] => Resolved::Update,
        [Action::Delete] => Resolved::Delete,
        [Action::Insert, .., Action::Delete] => Resolved::Noop,
        [Action::Insert, ..] => Resolved::Insert,
        [_, .., Action::Delete] => Resolved::Delete,
        [..] => Resolved::Update,
    }
}

#[derive(Debug)]
struct DocActions {
    actions: Vec<Action>,
    last: WalEntry,
}

#[derive(Debug, Default)]
struct Group {
    order: Vec<String>,
    docs: AHashMap<String, DocActions>,
}

/// Pending documents of one consumption run, keyed by target sub-shard.
#[derive(Debug)]
pub struct WalMergeDocs {
    latest: u64,
    groups: BTreeMap<u64, Group>,
    entries: usize,
}

impl WalMergeDocs {
    /// `latest` is the sub-shard that receives `NeedLatest` entries.
    pub fn new(latest: u64) -> Self {
        WalMergeDocs {
            latest,
            groups: BTreeMap::new(),
            entries: 0,
        }
    }

    /// Add an entry. `locate` finds the sub-shard already holding a document
    /// and is only called for `NeedUpdate` entries.
    pub fn add_entry<F>(&mut self, entry: WalEntry, locate: F) -> Result<()>
    where
        F: FnOnce(&str) -> Result<Option<u64>>,
    {
        let target = match entry.target {
            ShardTarget::SubShard(id) => id,
            ShardTarget::NeedLatest => self.latest,
            ShardTarget::NeedUpdate => locate(&entry.doc_id)?.unwrap_or(self.latest),
        };
        let group = self.groups.entry(target).or_default();
        self.entries += 1;
        match group.docs.get_mut(&entry.doc_id) {
            Some(doc) => {
                doc.actions.push(entry.action);
                doc.last = entry;
            }
            None => {
                group.order.push(entry.doc_id.clone());
                group.docs.insert(
                    entry.doc_id.clone(),
                    DocActions {
                        actions: vec![entry.action],
                        last: entry,
                    },
                );
            }
        }
        Ok(())
    }

    /// Distinct documents in the largest group.
    pub fn max_group_len(&self) -> usize {
        self.groups.values().map(|g| g.order.len()).max().unwrap_or(0)
    }

    /// Entries added since the last reset.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn reset(&mut self) {
        self.groups.clear();
        self.entries = 0;
    }

    /// Net resolution of every pending document, in arrival order per group.
    pub fn resolved(&self) -> Vec<(u64, &str, Resolved)> {
        self.groups
            .iter()
            .flat_map(|(target, group)| {
                group.order.iter().map(move |id| {
                    (*target, id.as_str(), resolve(&group.docs[id].actions))
                })
            })
            .collect()
    }

    /// One batch per affected sub-shard. `sub_shards` lists every sub-shard
    /// that may hold a stale copy of an updated or deleted document.
    pub fn plan(&self, mapping: &Mapping, sub_shards: &[u64]) -> BTreeMap<u64, SegmentBatch> {
        let mut batches: BTreeMap<u64, SegmentBatch> = BTreeMap::new();
        for (target, group) in &self.groups {
            for id in &group.order {
                let doc = &group.docs[id];
                let net = resolve(&doc.actions);
                match net {
                    Resolved::Noop => continue,
                    Resolved::Insert | Resolved::Update => {
                        let Some(built) = build_document(mapping, &doc.last) else {
                            continue;
                        };
                        let batch = batches.entry(*target).or_default();
                        if net == Resolved::Insert {
                            batch.insert(built);
                        } else {
                            batch.update(built);
                        }
                    }
                    Resolved::Delete => batches.entry(*target).or_default().delete(id.clone()),
                }
                if net != Resolved::Insert {
                    for other in sub_shards.iter().filter(|s| *s != target) {
                        batches.entry(*other).or_default().delete(id.clone());
                    }
                }
            }
        }
        batches
    }

    /// Compensating deletes for documents whose net action is an insert.
    pub fn plan_rollback(&self) -> BTreeMap<u64, SegmentBatch> {
        let mut batches: BTreeMap<u64, SegmentBatch> = BTreeMap::new();
        for (target, group) in &self.groups {
            for id in &group.order {
                if resolve(&group.docs[id].actions) == Resolved::Insert {
                    batches.entry(*target).or_default().delete(id.clone());
                }
            }
        }
        batches
    }
}

/// Segment document for an insert or update entry. Entries whose fields no
/// longer build against the mapping are logged and skipped.
fn build_document(mapping: &Mapping, entry: &WalEntry) -> Option<SegmentDocument> {
    let fields = match mapping.build_fields(&entry.document) {
        Ok(fields) => fields,
        Err(e) => {
            error!(
                "skipping wal entry {} for document [{}]: {e}",
                entry.seq, entry.doc_id
            );
            return None;
        }
    };
    let timestamp = DateTime::<Utc>::from_timestamp_nanos(entry.timestamp_nanos);
    let mut doc = SegmentDocument::new(entry.doc_id.clone(), timestamp);
    doc.fields = fields;
    doc.source = entry.source.clone();
    Some(doc)
}
