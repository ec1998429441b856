//! The persistent [`EntryRepository`].
//!
//! Reads are read-through: each one re-reads and re-verifies the table and
//! the log, so damage written underneath an open handle surfaces as
//! [`StorageError::Corruption`] on the very next call. The row set is small
//! and bounded, so the cost of that is a few kilobytes of I/O per call.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::file_lock::DirLock;
use super::schema::{self, StoredRow, CURRENT_VERSION};
use super::table::{self, TableMeta, TABLE_FILE};
use super::wal::{WalOp, WriteAheadLog, WAL_FILE};
use super::StoreConfig;
use crate::entry::SiteEntry;
use crate::storage::memory::{apply_ops, ordered};
use crate::storage::traits::{EntryRepository, RowOp, StorageError};

/// Result of folding the log into a new table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Rows in the new table.
    pub rows_written: usize,
    /// Log batches folded in.
    pub batches_folded: u64,
    /// Generation of the new table.
    pub generation: u64,
    /// Log size before compaction.
    pub wal_size_before: u64,
    /// Log size after compaction.
    pub wal_size_after: u64,
}

/// Store directory backed by a table file plus write-ahead log.
pub struct PersistentRepository {
    dir: PathBuf,
    _lock: DirLock,
    wal: WriteAheadLog,
    generation: u64,
    config: StoreConfig,
}

impl std::fmt::Debug for PersistentRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRepository")
            .field("dir", &self.dir)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PersistentRepository {
    /// Open or create the store in `dir`.
    ///
    /// Takes the directory lock, brings the schema up to date, opens the
    /// log and verifies every row once.
    ///
    /// # Errors
    /// - `Locked` if another handle owns the directory
    /// - `UnsupportedSchema` if the table is newer than this build
    /// - `Corruption` if the table or log fails verification
    pub fn open(dir: &Path, config: &StoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| StorageError::io("create store directory", e))?;
        let lock = DirLock::acquire(dir)?;
        table::remove_stale_temps(dir);

        let meta = schema::migrate(dir, config.sync_on_write)?;
        let mut wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)?;

        let batches = wal.batches()?;
        let stale = batches.iter().filter(|b| b.generation != meta.generation).count();
        if stale > 0 && stale == batches.len() {
            // Left behind by a crash between a table rewrite and the truncate.
            info!(stale, generation = meta.generation, "discarding stale log batches");
            wal.truncate()?;
        }

        let repo = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            generation: meta.generation,
            config: config.clone(),
        };
        let rows = repo.load_rows()?;
        info!(
            dir = %dir.display(),
            rows = rows.len(),
            generation = repo.generation,
            "opened top sites store"
        );
        Ok(repo)
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generation of the current table file.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current size of the log in bytes.
    #[must_use]
    pub fn wal_size_bytes(&self) -> u64 {
        self.wal.size_bytes()
    }

    fn corrupt(&self, file: &str, detail: impl Into<String>) -> StorageError {
        StorageError::corruption(self.dir.join(file).display().to_string(), detail)
    }

    /// Read the table, replay the log, and verify the result.
    fn load_rows(&self) -> Result<BTreeMap<String, SiteEntry>, StorageError> {
        let (meta, stored) = table::read_table::<StoredRow>(&self.dir.join(TABLE_FILE))?;
        if meta.version != CURRENT_VERSION {
            return Err(self.corrupt(TABLE_FILE, format!("schema version changed to {}", meta.version)));
        }
        if meta.generation != self.generation {
            return Err(self.corrupt(
                TABLE_FILE,
                format!("generation {} replaced underneath handle at {}", meta.generation, self.generation),
            ));
        }

        let mut rows = BTreeMap::new();
        for row in stored {
            let entry = row.into_entry().map_err(|e| self.corrupt(TABLE_FILE, e))?;
            if let Some(dup) = rows.insert(entry.url.clone(), entry) {
                return Err(self.corrupt(TABLE_FILE, format!("duplicate row for {}", dup.url)));
            }
        }

        for batch in self.wal.batches()? {
            if batch.generation != self.generation {
                continue;
            }
            let mut ops = Vec::with_capacity(batch.ops.len());
            for op in batch.ops {
                ops.push(match op {
                    WalOp::Upsert(row) => RowOp::Upsert(row.into_entry().map_err(|e| self.corrupt(WAL_FILE, e))?),
                    WalOp::Delete { url } => RowOp::Delete(url),
                });
            }
            apply_ops(&mut rows, ops);
        }

        Ok(rows)
    }

    /// Write every live row into a new table generation and empty the log.
    pub fn compact(&mut self) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal.size_bytes();
        let batches_folded = self.wal.current_sequence();

        let rows: Vec<StoredRow> = ordered(&self.load_rows()?).iter().map(StoredRow::from).collect();
        let meta = TableMeta::new(CURRENT_VERSION, self.generation + 1);
        table::write_table(&self.dir.join(TABLE_FILE), &meta, &rows)?;
        self.generation = meta.generation;
        self.wal.truncate()?;

        let result = CompactionResult {
            rows_written: rows.len(),
            batches_folded,
            generation: self.generation,
            wal_size_before,
            wal_size_after: self.wal.size_bytes(),
        };
        info!(
            rows = result.rows_written,
            batches = result.batches_folded,
            generation = result.generation,
            "compacted log into table"
        );
        Ok(result)
    }
}

impl EntryRepository for PersistentRepository {
    fn get(&self, url: &str) -> Result<Option<SiteEntry>, StorageError> {
        Ok(self.load_rows()?.remove(url))
    }

    fn scan_ordered(&self) -> Result<Vec<SiteEntry>, StorageError> {
        Ok(ordered(&self.load_rows()?))
    }

    fn apply_batch(&mut self, batch: Vec<RowOp>) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let ops: Vec<WalOp> = batch
            .into_iter()
            .map(|op| match op {
                RowOp::Upsert(entry) => WalOp::Upsert(StoredRow::from(&entry)),
                RowOp::Delete(url) => WalOp::Delete { url },
            })
            .collect();
        let count = ops.len();
        let sequence = self.wal.append(self.generation, ops)?;
        debug!(sequence, ops = count, "committed batch");

        if self.wal.size_bytes() > self.config.max_wal_size {
            // The batch is durable in the log either way. Damage found here
            // surfaces again on the next read; anything else retries on the
            // next write.
            if let Err(e) = self.compact() {
                warn!(error = %e, "automatic compaction failed");
            }
        }
        Ok(())
    }
}
