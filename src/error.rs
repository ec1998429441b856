//! Error types for the top sites store.
//!
//! Repository-level failures are [`StorageError`](crate::storage::StorageError).
//! Corruption never reaches callers of the store: it is recovered inside the
//! store and turned into the operation's ordinary "not found" answer. What
//! does reach callers is described here.

use thiserror::Error;

use crate::storage::StorageError;

/// Top-level error type returned by [`TopSitesStore`](crate::TopSitesStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unsupported schema version {found} (this build supports up to {supported})")]
    UnsupportedSchema {
        found: u32,
        supported: u32,
    },

    #[error("Store unavailable: {reason}")]
    StoreUnavailable {
        reason: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        message: String,
    },
}

impl StoreError {
    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns true if the on-disk schema is newer than this build.
    #[must_use]
    pub const fn is_unsupported_schema(&self) -> bool {
        matches!(self, Self::UnsupportedSchema { .. })
    }

    /// Returns true if the store must be re-initialized before further use.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Returns true if this error is terminal for the current store instance.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSchema { .. } | Self::StoreUnavailable { .. }
        )
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnsupportedSchema { found, supported } => {
                Self::UnsupportedSchema { found, supported }
            }
            other => Self::storage(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
