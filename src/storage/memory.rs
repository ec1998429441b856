//! In-memory storage backend.
//!
//! Intended for embedded usage, tests, and as a reference implementation of
//! [`EntryRepository`]. Batches are staged on a copy and swapped in, so a
//! failing batch leaves the previous state untouched.

use std::collections::BTreeMap;

use crate::entry::SiteEntry;
use crate::storage::traits::{EntryRepository, RowOp, StorageError};

/// Apply a batch to a URL-keyed row map.
pub(crate) fn apply_ops(rows: &mut BTreeMap<String, SiteEntry>, batch: Vec<RowOp>) {
    for op in batch {
        match op {
            RowOp::Upsert(entry) => {
                rows.insert(entry.url.clone(), entry);
            }
            RowOp::Delete(url) => {
                rows.remove(&url);
            }
        }
    }
}

/// Sort rows into listing order.
pub(crate) fn ordered(rows: &BTreeMap<String, SiteEntry>) -> Vec<SiteEntry> {
    let mut out: Vec<SiteEntry> = rows.values().cloned().collect();
    out.sort_by(SiteEntry::listing_cmp);
    out
}

/// Thread-unsafe in-memory repository.
#[derive(Debug, Default, Clone)]
pub struct MemoryRepository {
    rows: BTreeMap<String, SiteEntry>,
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl EntryRepository for MemoryRepository {
    fn get(&self, url: &str) -> Result<Option<SiteEntry>, StorageError> {
        Ok(self.rows.get(url).cloned())
    }

    fn delete_by_url(&mut self, url: &str) -> Result<bool, StorageError> {
        Ok(self.rows.remove(url).is_some())
    }

    fn scan_ordered(&self) -> Result<Vec<SiteEntry>, StorageError> {
        Ok(ordered(&self.rows))
    }

    fn apply_batch(&mut self, batch: Vec<RowOp>) -> Result<(), StorageError> {
        let mut staged = self.rows.clone();
        apply_ops(&mut staged, batch);
        self.rows = staged;
        Ok(())
    }
}
