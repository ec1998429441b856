//! The row repository seam.
//!
//! A repository stores site entries keyed by URL and knows nothing about
//! ranking policy. Every call may fail with [`StorageError::Corruption`];
//! recovering from that is the caller's job, not the repository's.

use thiserror::Error;

use crate::entry::SiteEntry;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Stored data failed verification (checksum, framing or decoding).
    #[error("Corruption detected in {context}: {message}")]
    Corruption {
        /// Which file or structure was damaged.
        context: String,
        /// What the check found.
        message: String,
    },

    /// The underlying medium failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being done.
        context: &'static str,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another handle owns the store directory.
    #[error("Store is locked by another process: {0}")]
    Locked(String),

    /// The table was written by a newer build.
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    UnsupportedSchema {
        /// Version found on disk.
        found: u32,
        /// Newest version this build reads.
        supported: u32,
    },
}

impl StorageError {
    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Wraps an I/O error with context.
    #[must_use]
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Returns true for detected structural damage.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// A single mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert the entry, replacing any row with the same URL.
    Upsert(SiteEntry),
    /// Delete the row with this URL, if present.
    Delete(String),
}

impl RowOp {
    /// The URL this mutation touches.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Upsert(entry) => &entry.url,
            Self::Delete(url) => url,
        }
    }
}

/// Storage trait for site entry rows.
///
/// # Atomicity
/// `apply_batch` must make either every mutation in the batch visible or
/// none of them, including across a crash.
pub trait EntryRepository {
    /// Get an entry by URL.
    fn get(&self, url: &str) -> Result<Option<SiteEntry>, StorageError>;

    /// Insert an entry, replacing any existing row with the same URL.
    fn insert_or_replace(&mut self, entry: SiteEntry) -> Result<(), StorageError> {
        self.apply_batch(vec![RowOp::Upsert(entry)])
    }

    /// Delete an entry by URL. Returns false if it was absent.
    fn delete_by_url(&mut self, url: &str) -> Result<bool, StorageError> {
        if self.get(url)?.is_none() {
            return Ok(false);
        }
        self.apply_batch(vec![RowOp::Delete(url.to_string())])?;
        Ok(true)
    }

    /// All entries, forced first by pin time, then organic by rank.
    fn scan_ordered(&self) -> Result<Vec<SiteEntry>, StorageError>;

    /// Apply every mutation as one atomic unit.
    fn apply_batch(&mut self, batch: Vec<RowOp>) -> Result<(), StorageError>;
}
