//! Corruption recovery.
//!
//! The controller owns the only repository handle. Calls pass straight
//! through while it is healthy. When a call reports corruption the handle
//! is dropped (releasing the directory lock), the directory is salvaged
//! into a fresh table, the store is reopened through the schema upgrade
//! path and organic ranks are renumbered. The call that hit the damage is
//! not retried; it gets `None` back and the caller turns that into its
//! ordinary "not found" answer.
//!
//! If any step of the rebuild fails, the controller is poisoned and every
//! call fails with [`StoreError::StoreUnavailable`] until
//! [`RecoveryController::reinitialize`] succeeds.

use std::mem;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::ranking::RankAllocator;
use crate::storage::persistent::{salvage, PersistentRepository, SalvageReport, StoreConfig};
use crate::storage::StorageError;

/// Externally visible controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Calls reach the repository.
    Healthy,
    /// A rebuild is running.
    Recovering,
    /// The last rebuild failed; the reason is kept for diagnostics.
    Poisoned(String),
}

enum Slot {
    Healthy(PersistentRepository),
    Recovering,
    Poisoned(String),
}

/// Owns the repository handle and rebuilds it after corruption.
pub struct RecoveryController {
    dir: PathBuf,
    config: StoreConfig,
    slot: Slot,
    recoveries: u64,
}

impl std::fmt::Debug for RecoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryController")
            .field("dir", &self.dir)
            .field("health", &self.health())
            .field("recoveries", &self.recoveries)
            .finish()
    }
}

/// Open the repository and close any gaps in the organic ranks.
///
/// Gaps are normal after a salvage pass, whether it ran here or was
/// started by hand.
fn open_ranked(dir: &Path, config: &StoreConfig) -> Result<PersistentRepository, StorageError> {
    let mut repo = PersistentRepository::open(dir, config)?;
    let moved = RankAllocator::new(&mut repo).renumber()?;
    if moved > 0 {
        info!(moved, "renumbered organic ranks");
    }
    Ok(repo)
}

/// Salvage, reopen and renumber.
fn rebuild(dir: &Path, config: &StoreConfig) -> Result<(PersistentRepository, SalvageReport), StorageError> {
    let report = salvage(dir, config.sync_on_write)?;
    let repo = open_ranked(dir, config)?;
    info!(
        recovered = report.recovered,
        skipped = report.skipped,
        "store rebuilt"
    );
    Ok((repo, report))
}

impl RecoveryController {
    /// Open the store in `dir`, recovering in place if it is damaged.
    ///
    /// # Errors
    /// - `UnsupportedSchema` if the table is newer than this build
    /// - `StoreUnavailable` if the store was damaged and could not be rebuilt
    /// - `Storage` for lock and I/O failures
    pub fn open(dir: &Path, config: StoreConfig) -> StoreResult<Self> {
        let mut controller = Self {
            dir: dir.to_path_buf(),
            config,
            slot: Slot::Recovering,
            recoveries: 0,
        };
        controller.connect()?;
        Ok(controller)
    }

    /// Replace whatever handle is held with a freshly opened one.
    fn connect(&mut self) -> StoreResult<()> {
        drop(mem::replace(&mut self.slot, Slot::Recovering));
        match open_ranked(&self.dir, &self.config) {
            Ok(repo) => {
                self.slot = Slot::Healthy(repo);
                Ok(())
            }
            Err(e) if e.is_corruption() => {
                warn!(dir = %self.dir.display(), error = %e, "store damaged at open");
                self.recover()
            }
            Err(e) => {
                self.slot = Slot::Poisoned(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn health(&self) -> Health {
        match &self.slot {
            Slot::Healthy(_) => Health::Healthy,
            Slot::Recovering => Health::Recovering,
            Slot::Poisoned(reason) => Health::Poisoned(reason.clone()),
        }
    }

    /// Number of successful rebuilds since this controller was created.
    #[must_use]
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `op` against the repository.
    ///
    /// Returns `Ok(None)` if `op` hit corruption and the store was rebuilt.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the controller is poisoned, or becomes so
    ///   because the rebuild failed
    /// - `Storage` for non-corruption repository failures
    pub fn run<T>(
        &mut self,
        name: &'static str,
        op: impl FnOnce(&mut PersistentRepository) -> Result<T, StorageError>,
    ) -> StoreResult<Option<T>> {
        let repo = match &mut self.slot {
            Slot::Healthy(repo) => repo,
            Slot::Recovering => return Err(StoreError::unavailable("recovery did not complete")),
            Slot::Poisoned(reason) => return Err(StoreError::unavailable(reason.clone())),
        };

        match op(repo) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_corruption() => {
                warn!(op = name, error = %e, "corruption detected, rebuilding store");
                self.recover()?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the handle and rebuild the directory from readable rows.
    fn recover(&mut self) -> StoreResult<()> {
        // The old handle holds the directory lock that salvage needs.
        drop(mem::replace(&mut self.slot, Slot::Recovering));

        match rebuild(&self.dir, &self.config) {
            Ok((repo, _)) => {
                self.slot = Slot::Healthy(repo);
                self.recoveries += 1;
                Ok(())
            }
            Err(e) => {
                let reason = format!("recovery failed: {e}");
                error!(dir = %self.dir.display(), error = %e, "store poisoned");
                self.slot = Slot::Poisoned(reason.clone());
                Err(StoreError::unavailable(reason))
            }
        }
    }

    /// Reopen the store from disk, leaving the poisoned state if it works.
    ///
    /// # Errors
    /// Same as [`RecoveryController::open`].
    pub fn reinitialize(&mut self) -> StoreResult<()> {
        info!(dir = %self.dir.display(), "reinitializing store");
        self.connect()
    }
}
