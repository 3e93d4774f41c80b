//! In-process segment store.
//!
//! Each directory is a list of documents. Sizes are the serialized JSON length
//! of the stored documents, which is enough to drive size-based rolling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, TesseraError};
use crate::segment::{
    SegmentBatch, SegmentDocument, SegmentOp, SegmentReader, SegmentStore, SegmentWriter,
};

#[derive(Debug, Default)]
struct Directory {
    docs: RwLock<Vec<(SegmentDocument, u64)>>,
}

impl Directory {
    fn apply(&self, batch: &SegmentBatch) -> Result<()> {
        let mut docs = self.docs.write();
        let mut staged = docs.clone();
        for op in batch.ops() {
            match op {
                SegmentOp::Insert(doc) => {
                    let size = serde_json::to_vec(doc)?.len() as u64;
                    staged.push((doc.clone(), size));
                }
                SegmentOp::Update(doc) => {
                    staged.retain(|(d, _)| d.id != doc.id);
                    let size = serde_json::to_vec(doc)?.len() as u64;
                    staged.push((doc.clone(), size));
                }
                SegmentOp::Delete(id) => staged.retain(|(d, _)| &d.id != id),
            }
        }
        *docs = staged;
        Ok(())
    }
}

/// Segment store keeping every directory in memory.
///
/// Writers can be told to fail their next batches, either before or after the
/// batch lands, to exercise the consumer's failure paths.
#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    dirs: RwLock<HashMap<String, Arc<Directory>>>,
    fail_before: Arc<AtomicUsize>,
    fail_after: Arc<AtomicUsize>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn dir(&self, dir: &str) -> Arc<Directory> {
        self.dirs
            .write()
            .entry(dir.to_string())
            .or_default()
            .clone()
    }

    /// Make the next `n` batches fail without applying anything.
    pub fn fail_next_batches(&self, n: usize) {
        self.fail_before.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` batches apply and then report failure, as if the
    /// process died right after the segment write.
    pub fn fail_after_next_batches(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Ids of every document in `dir`, duplicates included.
    pub fn doc_ids(&self, dir: &str) -> Vec<String> {
        self.dirs
            .read()
            .get(dir)
            .map(|d| d.docs.read().iter().map(|(doc, _)| doc.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Directory names in sorted order.
    pub fn dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.dirs.read().keys().cloned().collect();
        dirs.sort();
        dirs
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SegmentStore for MemorySegmentStore {
    fn open_writer(&self, dir: &str) -> Result<Arc<dyn SegmentWriter>> {
        Ok(Arc::new(MemorySegmentWriter {
            name: dir.to_string(),
            dir: self.dir(dir),
            fail_before: self.fail_before.clone(),
            fail_after: self.fail_after.clone(),
        }))
    }

    fn open_reader(&self, dir: &str) -> Result<Arc<dyn SegmentReader>> {
        Ok(Arc::new(MemorySegmentReader { dir: self.dir(dir) }))
    }

    fn delete_dir(&self, dir: &str) -> Result<()> {
        self.dirs.write().remove(dir);
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySegmentWriter {
    name: String,
    dir: Arc<Directory>,
    fail_before: Arc<AtomicUsize>,
    fail_after: Arc<AtomicUsize>,
}

impl SegmentWriter for MemorySegmentWriter {
    fn batch(&self, batch: &SegmentBatch) -> Result<()> {
        if take_one(&self.fail_before) {
            return Err(TesseraError::consumption(format!(
                "segment [{}] rejected batch",
                self.name
            )));
        }
        self.dir.apply(batch)?;
        if take_one(&self.fail_after) {
            return Err(TesseraError::consumption(format!(
                "segment [{}] lost acknowledgement",
                self.name
            )));
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.dir.docs.read().iter().map(|(_, size)| size).sum())
    }

    fn reader(&self) -> Result<Arc<dyn SegmentReader>> {
        Ok(Arc::new(MemorySegmentReader {
            dir: self.dir.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySegmentReader {
    dir: Arc<Directory>,
}

impl SegmentReader for MemorySegmentReader {
    fn get(&self, doc_id: &str) -> Result<Option<SegmentDocument>> {
        Ok(self
            .dir
            .docs
            .read()
            .iter()
            .rev()
            .find(|(doc, _)| doc.id == doc_id)
            .map(|(doc, _)| doc.clone()))
    }

    fn doc_count(&self) -> Result<u64> {
        Ok(self.dir.docs.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(id: &str) -> SegmentDocument {
        SegmentDocument::new(id, Utc::now()).add_field("n", 1.0)
    }

    #[test]
    fn test_batch_semantics() {
        let store = MemorySegmentStore::new();
        let writer = store.open_writer("idx/a/000000").unwrap();

        let mut batch = SegmentBatch::new();
        batch.insert(doc("1"));
        batch.insert(doc("1"));
        batch.insert(doc("2"));
        writer.batch(&batch).unwrap();
        assert_eq!(store.doc_ids("idx/a/000000"), vec!["1", "1", "2"]);

        let mut batch = SegmentBatch::new();
        batch.update(doc("1"));
        batch.delete("2");
        batch.delete("missing");
        writer.batch(&batch).unwrap();
        assert_eq!(store.doc_ids("idx/a/000000"), vec!["1"]);
        assert!(writer.size().unwrap() > 0);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemorySegmentStore::new();
        let writer = store.open_writer("d").unwrap();
        let mut batch = SegmentBatch::new();
        batch.insert(doc("1"));

        store.fail_next_batches(1);
        assert!(writer.batch(&batch).is_err());
        assert_eq!(store.open_reader("d").unwrap().doc_count().unwrap(), 0);

        store.fail_after_next_batches(1);
        assert!(writer.batch(&batch).is_err());
        assert_eq!(store.open_reader("d").unwrap().doc_count().unwrap(), 1);

        writer.batch(&batch).unwrap();
        assert_eq!(store.open_reader("d").unwrap().doc_count().unwrap(), 2);
    }
}
