//! # topsites - a crash-safe ranked URL store
//!
//! Tracks a bounded set of "most visited" sites with their thumbnails and
//! keeps them in a stable order: pinned entries first by pin time, then
//! organic entries by a dense rank starting at 0.
//!
//! ## Core Concepts
//!
//! - **SiteEntry**: one URL with its rank and opaque metadata payload
//! - **Rank**: `Forced { since }` for pinned entries, `Organic(n)` otherwise
//! - **RankAllocator**: turns a placement request into one atomic batch of
//!   row updates that keeps organic ranks dense
//! - **RecoveryController**: rebuilds the store from readable rows when
//!   on-disk damage is detected
//!
//! ## Usage
//!
//! ```rust,no_run
//! use topsites::{RankRequest, SiteMetadata, TopSitesStore};
//!
//! let mut store = TopSitesStore::init("./top-sites")?;
//! store.set_entry("https://a.example/", SiteMetadata::titled("A"), RankRequest::Organic(0))?;
//! store.set_entry("https://b.example/", SiteMetadata::titled("B"), RankRequest::forced())?;
//!
//! for entry in store.get_entries()? {
//!     println!("{} {:?}", entry.url, entry.rank);
//! }
//! # Ok::<(), topsites::StoreError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod entry;
pub mod error;
pub mod ranking;
pub mod recovery;
pub mod storage;
pub mod store;

pub use entry::{
    Rank, RankRequest, SiteEntry, SiteMetadata, Thumbnail, ThumbnailScore, RANK_OF_FORCED_URL,
    RANK_OF_NON_EXISTING_URL,
};
pub use error::{StoreError, StoreResult};
pub use ranking::RankAllocator;
pub use recovery::{Health, RecoveryController};
pub use storage::persistent::{salvage, CompactionResult, SalvageReport, StoreConfig};
pub use storage::{EntryRepository, MemoryRepository, RowOp, StorageError};
pub use store::TopSitesStore;
