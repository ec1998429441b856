//! Row storage for site entries.
//!
//! [`EntryRepository`] is the seam between ranking policy and bytes on
//! disk. [`MemoryRepository`] backs tests and embedders that do not need
//! durability; [`persistent::PersistentRepository`] is the real store.

mod memory;
pub mod persistent;
mod traits;

pub use memory::MemoryRepository;
pub use traits::{EntryRepository, RowOp, StorageError};
