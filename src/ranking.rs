//! Rank allocation.
//!
//! Ranks are never tracked by a counter. Every mutation starts from the
//! current ordered listing, computes the next listing, and emits the
//! smallest set of row updates that turns one into the other. The planners
//! in this module are pure functions over a snapshot; the `RankAllocator`
//! applies their output to a repository as one atomic batch.
//!
//! Invariants kept by every plan:
//! - organic ranks are exactly `0..K` for K organic entries
//! - forced entries carry a pin time and no organic rank

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::entry::{Rank, RankRequest, SiteEntry, SiteMetadata};
use crate::storage::{EntryRepository, RowOp, StorageError};

fn organic_rank(index: usize) -> Rank {
    Rank::Organic(u32::try_from(index).unwrap_or(u32::MAX))
}

/// Organic entries other than `skip`, in rank order.
fn organic_except<'a>(snapshot: &'a [SiteEntry], skip: Option<&str>) -> Vec<&'a SiteEntry> {
    let mut out: Vec<&SiteEntry> = snapshot
        .iter()
        .filter(|e| !e.rank.is_forced() && Some(e.url.as_str()) != skip)
        .collect();
    out.sort_by(|a, b| a.listing_cmp(b));
    out
}

/// Emit upserts for every organic entry whose position no longer matches its rank.
fn renumber_ops(order: &[&SiteEntry], ops: &mut Vec<RowOp>) {
    for (index, entry) in order.iter().enumerate() {
        let rank = organic_rank(index);
        if entry.rank != rank {
            let mut moved = (*entry).clone();
            moved.rank = rank;
            ops.push(RowOp::Upsert(moved));
        }
    }
}

/// Plan placing `url` with `metadata` at `request`.
///
/// The target row is upserted (unless it is already stored exactly as
/// requested) and every other organic row whose rank shifts is re-keyed.
#[must_use]
pub fn plan_placement(
    snapshot: &[SiteEntry],
    url: &str,
    metadata: SiteMetadata,
    request: RankRequest,
    now: DateTime<Utc>,
) -> Vec<RowOp> {
    let existing = snapshot.iter().find(|e| e.url == url);
    let rest = organic_except(snapshot, Some(url));

    let rank = match request {
        RankRequest::Forced { at } => {
            let since = at
                .or_else(|| existing.and_then(SiteEntry::forced_time))
                .unwrap_or(now);
            Rank::Forced { since }
        }
        RankRequest::Organic(position) => {
            let position = position.min(rest.len());
            organic_rank(position)
        }
    };

    let target = SiteEntry::new(url, rank, metadata);
    let mut ops = Vec::new();
    if existing != Some(&target) {
        ops.push(RowOp::Upsert(target));
    }

    match rank.organic() {
        Some(position) => {
            let position = position as usize;
            for (index, entry) in rest.iter().enumerate() {
                let shifted = organic_rank(if index < position { index } else { index + 1 });
                if entry.rank != shifted {
                    let mut moved = (*entry).clone();
                    moved.rank = shifted;
                    ops.push(RowOp::Upsert(moved));
                }
            }
        }
        None => renumber_ops(&rest, &mut ops),
    }

    ops
}

/// Plan moving an existing entry without touching its metadata.
///
/// Returns `None` if `url` is not in the snapshot.
#[must_use]
pub fn plan_rank_update(
    snapshot: &[SiteEntry],
    url: &str,
    request: RankRequest,
    now: DateTime<Utc>,
) -> Option<Vec<RowOp>> {
    let existing = snapshot.iter().find(|e| e.url == url)?;
    Some(plan_placement(
        snapshot,
        url,
        existing.metadata.clone(),
        request,
        now,
    ))
}

/// Plan deleting `url` and closing the gap it leaves.
///
/// Returns `None` if `url` is not in the snapshot. Removing a forced entry
/// never shifts anything, since forced order comes from pin times.
#[must_use]
pub fn plan_removal(snapshot: &[SiteEntry], url: &str) -> Option<Vec<RowOp>> {
    snapshot.iter().find(|e| e.url == url)?;
    let mut ops = vec![RowOp::Delete(url.to_string())];
    renumber_ops(&organic_except(snapshot, Some(url)), &mut ops);
    Some(ops)
}

/// Plan re-deriving dense organic ranks in the current relative order.
///
/// Used after a salvage, when rows may carry gaps or duplicate ranks.
#[must_use]
pub fn plan_renumber(snapshot: &[SiteEntry]) -> Vec<RowOp> {
    let mut ops = Vec::new();
    renumber_ops(&organic_except(snapshot, None), &mut ops);
    ops
}

/// Zero-based position of `url` in the full listing.
#[must_use]
pub fn position_of(snapshot: &[SiteEntry], url: &str) -> Option<usize> {
    snapshot.iter().position(|e| e.url == url)
}

/// Applies ranking plans to a repository.
///
/// Each mutation reads one snapshot and writes one atomic batch, so a crash
/// can never leave a gap or a duplicate rank behind.
pub struct RankAllocator<'a, R: EntryRepository + ?Sized> {
    repo: &'a mut R,
}

impl<'a, R: EntryRepository + ?Sized> RankAllocator<'a, R> {
    /// Wrap a repository.
    pub fn new(repo: &'a mut R) -> Self {
        Self { repo }
    }

    fn commit(&mut self, op: &'static str, ops: Vec<RowOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        debug!(op, rows = ops.len(), "applying rank batch");
        self.repo.apply_batch(ops)
    }

    /// Insert or replace an entry at the requested placement.
    pub fn set_entry(
        &mut self,
        url: &str,
        metadata: SiteMetadata,
        request: RankRequest,
    ) -> Result<(), StorageError> {
        let snapshot = self.repo.scan_ordered()?;
        let ops = plan_placement(&snapshot, url, metadata, request, Utc::now());
        self.commit("set_entry", ops)
    }

    /// Move an existing entry. Returns false if `url` is unknown.
    pub fn update_rank(&mut self, url: &str, request: RankRequest) -> Result<bool, StorageError> {
        let snapshot = self.repo.scan_ordered()?;
        let Some(ops) = plan_rank_update(&snapshot, url, request, Utc::now()) else {
            return Ok(false);
        };
        self.commit("update_rank", ops)?;
        Ok(true)
    }

    /// Remove an entry. Returns false if `url` is unknown.
    pub fn remove_entry(&mut self, url: &str) -> Result<bool, StorageError> {
        let snapshot = self.repo.scan_ordered()?;
        let Some(ops) = plan_removal(&snapshot, url) else {
            return Ok(false);
        };
        self.commit("remove_entry", ops)?;
        Ok(true)
    }

    /// Re-derive dense organic ranks. Returns how many rows moved.
    pub fn renumber(&mut self) -> Result<usize, StorageError> {
        let snapshot = self.repo.scan_ordered()?;
        let ops = plan_renumber(&snapshot);
        let moved = ops.len();
        self.commit("renumber", ops)?;
        Ok(moved)
    }

    /// Position of `url` in the full listing.
    pub fn rank_of(&self, url: &str) -> Result<Option<usize>, StorageError> {
        let snapshot = self.repo.scan_ordered()?;
        Ok(position_of(&snapshot, url))
    }
}
