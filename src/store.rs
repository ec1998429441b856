//! The public store facade.
//!
//! [`TopSitesStore`] composes the pieces: the recovery controller owns the
//! repository, and every mutation goes through the rank allocator as one
//! atomic batch. Corruption never reaches the caller. The call that runs
//! into it gets its ordinary negative answer (`false`, `None` or an empty
//! listing) and the next call sees the rebuilt store.

use std::path::Path;

use tracing::info;

use crate::entry::{RankRequest, SiteEntry, SiteMetadata};
use crate::error::StoreResult;
use crate::ranking::RankAllocator;
use crate::recovery::{Health, RecoveryController};
use crate::storage::persistent::{CompactionResult, StoreConfig};
use crate::storage::EntryRepository;

/// Persistent ranked store of top sites.
///
/// # Example
/// ```rust,no_run
/// use topsites::{RankRequest, SiteMetadata, TopSitesStore};
///
/// let mut store = TopSitesStore::init("./top-sites")?;
/// store.set_entry("https://example.com/", SiteMetadata::titled("Example"), RankRequest::Organic(0))?;
/// assert_eq!(store.rank_of("https://example.com/")?, Some(0));
/// # Ok::<(), topsites::StoreError>(())
/// ```
#[derive(Debug)]
pub struct TopSitesStore {
    controller: RecoveryController,
}

impl TopSitesStore {
    /// Open or create the store at `path` with default settings.
    ///
    /// # Errors
    /// - `UnsupportedSchema` if the store was written by a newer build
    /// - `StoreUnavailable` if the store was damaged beyond rebuilding
    /// - `Storage` if the directory is locked or unreadable
    pub fn init(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::init_with_config(path, StoreConfig::default())
    }

    /// Open or create the store at `path`.
    ///
    /// # Errors
    /// As [`TopSitesStore::init`], plus `InvalidConfig`.
    pub fn init_with_config(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let config = config.validate()?;
        let controller = RecoveryController::open(path.as_ref(), config)?;
        info!(dir = %path.as_ref().display(), "top sites store ready");
        Ok(Self { controller })
    }

    /// Every entry, forced first by pin time, then organic by rank.
    pub fn get_entries(&mut self) -> StoreResult<Vec<SiteEntry>> {
        let entries = self
            .controller
            .run("get_entries", |repo| repo.scan_ordered())?;
        Ok(entries.unwrap_or_default())
    }

    /// Insert or replace `url` with `metadata` at the requested placement.
    ///
    /// Returns false if damage was found before the write committed; the
    /// store is rebuilt and the write is not applied. Once committed the
    /// write is reported as done, even if damage turns up afterwards.
    pub fn set_entry(
        &mut self,
        url: &str,
        metadata: SiteMetadata,
        rank: RankRequest,
    ) -> StoreResult<bool> {
        let done = self.controller.run("set_entry", |repo| {
            RankAllocator::new(repo).set_entry(url, metadata, rank)
        })?;
        Ok(done.is_some())
    }

    /// Move `url` without touching its metadata. Returns false if unknown.
    pub fn update_rank(&mut self, url: &str, rank: RankRequest) -> StoreResult<bool> {
        let moved = self
            .controller
            .run("update_rank", |repo| RankAllocator::new(repo).update_rank(url, rank))?;
        Ok(moved.unwrap_or(false))
    }

    /// Delete `url`, closing the gap it leaves. Returns false if unknown.
    pub fn remove_entry(&mut self, url: &str) -> StoreResult<bool> {
        let removed = self
            .controller
            .run("remove_entry", |repo| RankAllocator::new(repo).remove_entry(url))?;
        Ok(removed.unwrap_or(false))
    }

    /// Zero-based position of `url` in the listing, `None` if absent.
    pub fn rank_of(&mut self, url: &str) -> StoreResult<Option<usize>> {
        let rank = self
            .controller
            .run("rank_of", |repo| RankAllocator::new(repo).rank_of(url))?;
        Ok(rank.flatten())
    }

    /// Fold the write-ahead log into the table now.
    ///
    /// Returns `None` if compaction ran into corruption and the store was
    /// rebuilt instead.
    pub fn compact(&mut self) -> StoreResult<Option<CompactionResult>> {
        self.controller.run("compact", |repo| repo.compact())
    }

    /// State of the recovery controller.
    #[must_use]
    pub fn health(&self) -> Health {
        self.controller.health()
    }

    /// Reopen the store from disk, the way out of [`Health::Poisoned`].
    ///
    /// # Errors
    /// As [`TopSitesStore::init`].
    pub fn reinitialize(&mut self) -> StoreResult<()> {
        self.controller.reinitialize()
    }

    /// Directory this store lives in.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.controller.dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Rank;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn open(dir: &Path) -> TopSitesStore {
        let config = StoreConfig {
            sync_on_write: false,
            ..StoreConfig::default()
        };
        TopSitesStore::init_with_config(dir, config).unwrap()
    }

    fn urls(store: &mut TopSitesStore) -> Vec<String> {
        store.get_entries().unwrap().into_iter().map(|e| e.url).collect()
    }

    #[test]
    fn test_empty_store() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        assert!(store.get_entries().unwrap().is_empty());
        assert_eq!(store.rank_of("http://nowhere/").unwrap(), None);
        assert!(!store.remove_entry("http://nowhere/").unwrap());
        assert!(!store.update_rank("http://nowhere/", RankRequest::Organic(0)).unwrap());
        assert_eq!(store.health(), Health::Healthy);
    }

    #[test]
    fn test_set_then_rank_of() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        assert!(store.set_entry("http://a/", SiteMetadata::titled("A"), RankRequest::Organic(0)).unwrap());
        assert!(store.set_entry("http://b/", SiteMetadata::titled("B"), RankRequest::Organic(9)).unwrap());

        assert_eq!(store.rank_of("http://a/").unwrap(), Some(0));
        assert_eq!(store.rank_of("http://b/").unwrap(), Some(1), "clamped to the end");
    }

    #[test]
    fn test_pinned_entry_leads_listing() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.set_entry("http://a/", SiteMetadata::default(), RankRequest::Organic(0)).unwrap();
        let pinned_at = Utc.timestamp_opt(1_600_000_000, 0).single().unwrap();
        store
            .set_entry("http://pin/", SiteMetadata::default(), RankRequest::forced_at(pinned_at))
            .unwrap();

        let entries = store.get_entries().unwrap();
        assert_eq!(entries[0].url, "http://pin/");
        assert_eq!(entries[0].rank, Rank::Forced { since: pinned_at });
        assert_eq!(entries[1].rank, Rank::Organic(0));
    }

    #[test]
    fn test_update_rank_keeps_metadata() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        for (i, url) in ["http://a/", "http://b/", "http://c/"].iter().enumerate() {
            store.set_entry(url, SiteMetadata::titled(*url), RankRequest::Organic(i)).unwrap();
        }

        assert!(store.update_rank("http://c/", RankRequest::Organic(0)).unwrap());
        let entries = store.get_entries().unwrap();
        assert_eq!(entries[0].url, "http://c/");
        assert_eq!(entries[0].metadata.title, "http://c/");
    }

    #[test]
    fn test_remove_twice() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.set_entry("http://a/", SiteMetadata::default(), RankRequest::Organic(0)).unwrap();
        store.set_entry("http://b/", SiteMetadata::default(), RankRequest::Organic(1)).unwrap();

        assert!(store.remove_entry("http://a/").unwrap());
        assert!(!store.remove_entry("http://a/").unwrap());
        assert_eq!(urls(&mut store), ["http://b/"]);
        assert_eq!(store.rank_of("http://b/").unwrap(), Some(0));
    }

    #[test]
    fn test_entries_survive_reinit() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path());
            store.set_entry("http://a/", SiteMetadata::titled("A"), RankRequest::Organic(0)).unwrap();
            store.compact().unwrap().unwrap();
            store.set_entry("http://b/", SiteMetadata::titled("B"), RankRequest::Organic(0)).unwrap();
        }
        let mut store = open(dir.path());
        assert_eq!(urls(&mut store), ["http://b/", "http://a/"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            max_wal_size: 1,
            ..StoreConfig::default()
        };
        let err = TopSitesStore::init_with_config(dir.path(), config).unwrap_err();
        assert!(matches!(err, crate::StoreError::InvalidConfig { .. }));
    }
}
