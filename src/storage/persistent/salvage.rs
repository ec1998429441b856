//! Salvage pass: rebuild a store directory from whatever still decodes.
//!
//! The damaged table is read frame by frame and the log batches of the
//! same generation are replayed on top, each skipping what fails its
//! checksum or does not parse. The survivors are written as a brand-new
//! current-schema table in their observed order, and the log is emptied.
//! Organic ranks in the result may have gaps; closing them is left to the
//! rank allocator once the store is reopened.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use super::file_lock::DirLock;
use super::schema::{RowV2, StoredRow, CURRENT_VERSION, DEPRECATED_VERSION};
use super::table::{self, TableMeta, TABLE_FILE};
use super::wal::{self, WalOp, WAL_FILE};
use crate::entry::SiteEntry;
use crate::storage::traits::StorageError;

/// Outcome of a salvage pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalvageReport {
    /// Rows written to the rebuilt table.
    pub recovered: usize,
    /// Rows and batches that could not be read.
    pub skipped: usize,
    /// Schema version of the damaged table, if its meta row survived.
    pub source_version: Option<u32>,
    /// Generation of the rebuilt table.
    pub generation: u64,
}

/// Decode a salvaged row in whichever layout it was written.
fn decode_row(value: Value, version: Option<u32>) -> Option<StoredRow> {
    match version {
        Some(2) => serde_json::from_value::<RowV2>(value).ok().map(StoredRow::from),
        Some(_) => serde_json::from_value::<StoredRow>(value).ok(),
        None => serde_json::from_value::<StoredRow>(value.clone())
            .ok()
            .or_else(|| serde_json::from_value::<RowV2>(value).ok().map(StoredRow::from)),
    }
}

/// Rebuild the store in `dir` from its readable rows.
///
/// Takes the directory lock for the duration of the pass, so no handle may
/// be open on `dir`.
///
/// # Errors
/// - `UnsupportedSchema` if the surviving meta row names a newer version
/// - `Locked` if another handle owns the directory
/// - `Io` if the medium itself fails
pub fn salvage(dir: &Path, sync: bool) -> Result<SalvageReport, StorageError> {
    fs::create_dir_all(dir).map_err(|e| StorageError::io("create store directory", e))?;
    let _lock = DirLock::acquire(dir)?;
    table::remove_stale_temps(dir);

    let damaged = table::salvage_table::<Value>(&dir.join(TABLE_FILE))?;
    let version = damaged.meta.as_ref().map(|m| m.version);
    if let Some(found) = version.filter(|v| *v > CURRENT_VERSION) {
        return Err(StorageError::UnsupportedSchema {
            found,
            supported: CURRENT_VERSION,
        });
    }
    let mut skipped = damaged.skipped;

    let (batches, bad_batches) = wal::salvage_batches(&dir.join(WAL_FILE))?;
    skipped += bad_batches;

    let mut by_url: BTreeMap<String, StoredRow> = BTreeMap::new();
    let deprecated = version.is_some_and(|v| v <= DEPRECATED_VERSION);
    if deprecated {
        info!(rows = damaged.rows.len(), "salvaged table uses deprecated schema, rows dropped");
    } else {
        for value in damaged.rows {
            match decode_row(value, version) {
                Some(row) => {
                    by_url.insert(row.url.clone(), row);
                }
                None => skipped += 1,
            }
        }

        let generation = damaged.meta.as_ref().map(|m| m.generation);
        for batch in batches {
            if generation.is_some_and(|g| g != batch.generation) {
                continue;
            }
            for op in batch.ops {
                match op {
                    WalOp::Upsert(row) => {
                        by_url.insert(row.url.clone(), row);
                    }
                    WalOp::Delete { url } => {
                        by_url.remove(&url);
                    }
                }
            }
        }
    }

    let mut entries: Vec<SiteEntry> = Vec::with_capacity(by_url.len());
    for row in by_url.into_values() {
        match row.into_entry() {
            Ok(entry) => entries.push(entry),
            Err(reason) => {
                warn!(%reason, "dropping inconsistent row");
                skipped += 1;
            }
        }
    }
    entries.sort_by(SiteEntry::listing_cmp);

    let base = damaged.meta.as_ref().map_or(0, |m| m.generation);
    let meta = TableMeta::new(CURRENT_VERSION, base + 1);
    let rows: Vec<StoredRow> = entries.iter().map(StoredRow::from).collect();
    table::write_table(&dir.join(TABLE_FILE), &meta, &rows)?;
    wal::reset(&dir.join(WAL_FILE), sync)?;

    let report = SalvageReport {
        recovered: rows.len(),
        skipped,
        source_version: version,
        generation: meta.generation,
    };
    warn!(
        dir = %dir.display(),
        recovered = report.recovered,
        skipped = report.skipped,
        "rebuilt store from salvaged rows"
    );
    Ok(report)
}
