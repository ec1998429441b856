//! Persistent storage backend.
//!
//! A store is one directory:
//! - `topsites.tbl`: a checksummed snapshot of every row, rewritten whole
//! - `topsites.wal`: batches committed since the snapshot
//! - `.lock`: held by the one open handle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   PersistentRepository                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ WriteAheadLog   │  │ table snapshot  │ ← schema::migrate  │
//! │  │ (append-only)   │  │ (temp + rename) │ ← salvage          │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   DirLock (flock)   │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod repository;
mod salvage;
pub mod schema;
pub mod table;
mod wal;

pub use file_lock::{DirLock, LOCK_FILE};
pub use repository::{CompactionResult, PersistentRepository};
pub use salvage::{salvage, SalvageReport};
pub use schema::{CURRENT_VERSION, DEPRECATED_VERSION};
pub use table::{TableMeta, TABLE_FILE};
pub use wal::WAL_FILE;

use crate::error::{StoreError, StoreResult};

/// Configuration for a persistent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Whether to fsync the log after every batch.
    pub sync_on_write: bool,
    /// Log size in bytes above which the log is folded into the table.
    pub max_wal_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_wal_size: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl StoreConfig {
    /// Smallest accepted `max_wal_size`; below this every write compacts.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Check the configuration, returning it unchanged if usable.
    pub fn validate(self) -> StoreResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StoreError::InvalidConfig {
                message: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}
