//! Row layouts and schema upgrades.
//!
//! | version | layout                                                   |
//! |---------|----------------------------------------------------------|
//! | 1       | deprecated; upgrading drops every row                    |
//! | 2       | `url, url_rank, title, thumbnail, redirects` + score cols |
//! | 3       | v2 + nullable `last_forced`                              |
//!
//! Upgrades run stepwise until the table is current. Each step writes the
//! next-version table through an atomic rename with a new generation and
//! then resets the log, so a step interrupted at any point can simply be
//! run again.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::table::{self, TableMeta, TABLE_FILE};
use super::wal::{self, WalOp, WAL_FILE};
use crate::entry::{Rank, SiteEntry, SiteMetadata, Thumbnail, ThumbnailScore, RANK_OF_FORCED_URL};
use crate::storage::traits::StorageError;

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 3;

/// Versions at or below this are upgraded by discarding their rows.
pub const DEPRECATED_VERSION: u32 = 1;

/// A row in the current (v3) layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Unique key.
    pub url: String,
    /// Organic rank, or [`RANK_OF_FORCED_URL`] for pinned rows.
    pub url_rank: i64,
    /// Page title.
    pub title: String,
    /// Encoded thumbnail image.
    pub thumbnail: Vec<u8>,
    /// Redirect chain ending at `url`.
    pub redirects: Vec<String>,
    /// Thumbnail score columns.
    #[serde(with = "score_column")]
    pub boring_score: f64,
    #[allow(missing_docs)]
    pub good_clipping: bool,
    #[allow(missing_docs)]
    pub at_top: bool,
    /// When the thumbnail was captured.
    pub last_updated: DateTime<Utc>,
    #[allow(missing_docs)]
    pub load_completed: bool,
    /// Pin time; set exactly when the row is forced.
    pub last_forced: Option<DateTime<Utc>>,
}

/// A row in the v2 layout, before pinning existed.
///
/// Same columns as [`StoredRow`] without `last_forced`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowV2 {
    pub url: String,
    pub url_rank: i64,
    pub title: String,
    pub thumbnail: Vec<u8>,
    pub redirects: Vec<String>,
    #[serde(with = "score_column")]
    pub boring_score: f64,
    pub good_clipping: bool,
    pub at_top: bool,
    pub last_updated: DateTime<Utc>,
    pub load_completed: bool,
}

/// JSON has no NaN or infinity, so those scores are written as strings.
mod score_column {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Column {
        Number(f64),
        Text(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(score: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let column = if score.is_finite() {
            Column::Number(*score)
        } else if score.is_nan() {
            Column::Text("NaN".to_string())
        } else if score.is_sign_positive() {
            Column::Text("inf".to_string())
        } else {
            Column::Text("-inf".to_string())
        };
        column.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Column::deserialize(deserializer)? {
            Column::Number(score) => Ok(score),
            Column::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid score {other:?}"))),
            },
        }
    }
}

impl From<RowV2> for StoredRow {
    fn from(row: RowV2) -> Self {
        Self {
            url: row.url,
            url_rank: row.url_rank,
            title: row.title,
            thumbnail: row.thumbnail,
            redirects: row.redirects,
            boring_score: row.boring_score,
            good_clipping: row.good_clipping,
            at_top: row.at_top,
            last_updated: row.last_updated,
            load_completed: row.load_completed,
            last_forced: None,
        }
    }
}

impl From<&SiteEntry> for StoredRow {
    fn from(entry: &SiteEntry) -> Self {
        let meta = &entry.metadata;
        let score = &meta.thumbnail.score;
        Self {
            url: entry.url.clone(),
            url_rank: entry.rank.as_column(),
            title: meta.title.clone(),
            thumbnail: meta.thumbnail.data.clone(),
            redirects: meta.redirects.clone(),
            boring_score: score.boring_score,
            good_clipping: score.good_clipping,
            at_top: score.at_top,
            last_updated: score.time_at_snapshot,
            load_completed: score.load_completed,
            last_forced: entry.forced_time(),
        }
    }
}

impl StoredRow {
    /// Convert to an entry, rejecting rows whose rank columns disagree.
    pub fn into_entry(self) -> Result<SiteEntry, String> {
        let rank = match (self.last_forced, self.url_rank) {
            (Some(since), _) => Rank::Forced { since },
            (None, RANK_OF_FORCED_URL) => {
                return Err(format!("row {} is forced but has no pin time", self.url));
            }
            (None, rank) => Rank::Organic(
                u32::try_from(rank).map_err(|_| format!("row {} has invalid rank {rank}", self.url))?,
            ),
        };
        let metadata = SiteMetadata {
            title: self.title,
            redirects: self.redirects,
            thumbnail: Thumbnail {
                data: self.thumbnail,
                score: ThumbnailScore {
                    boring_score: self.boring_score,
                    good_clipping: self.good_clipping,
                    at_top: self.at_top,
                    load_completed: self.load_completed,
                    time_at_snapshot: self.last_updated,
                },
            },
        };
        Ok(SiteEntry::new(self.url, rank, metadata))
    }
}

/// Bring the table in `dir` to [`CURRENT_VERSION`].
///
/// Creates an empty current table if none exists. Returns the meta row of
/// the resulting table.
///
/// # Errors
/// - `UnsupportedSchema` if the table is newer than this build
/// - `Corruption` if the meta row or (during an upgrade) any row is damaged
pub fn migrate(dir: &Path, sync: bool) -> Result<TableMeta, StorageError> {
    let path = dir.join(TABLE_FILE);
    if !path.exists() {
        info!(dir = %dir.display(), version = CURRENT_VERSION, "creating new table");
        let meta = TableMeta::new(CURRENT_VERSION, 1);
        table::write_table::<StoredRow>(&path, &meta, &[])?;
        wal::reset(&dir.join(WAL_FILE), sync)?;
        return Ok(meta);
    }

    loop {
        let meta = table::read_meta(&path)?;
        match meta.version {
            CURRENT_VERSION => return Ok(meta),
            v if v > CURRENT_VERSION => {
                return Err(StorageError::UnsupportedSchema {
                    found: v,
                    supported: CURRENT_VERSION,
                });
            }
            v if v <= DEPRECATED_VERSION => drop_deprecated(dir, &meta, sync)?,
            _ => upgrade_v2_to_v3(dir, &meta, sync)?,
        }
    }
}

fn drop_deprecated(dir: &Path, meta: &TableMeta, sync: bool) -> Result<(), StorageError> {
    info!(from = meta.version, "discarding rows of deprecated schema");
    let next = TableMeta::new(2, meta.generation + 1);
    table::write_table::<RowV2>(&dir.join(TABLE_FILE), &next, &[])?;
    wal::reset(&dir.join(WAL_FILE), sync)
}

fn upgrade_v2_to_v3(dir: &Path, meta: &TableMeta, sync: bool) -> Result<(), StorageError> {
    let path = dir.join(TABLE_FILE);
    let (_, rows) = table::read_table::<RowV2>(&path)?;

    let mut by_url: BTreeMap<String, StoredRow> = rows
        .into_iter()
        .map(|row| (row.url.clone(), StoredRow::from(row)))
        .collect();

    // Fold pending log batches so the upgrade carries every committed row.
    for batch in wal::read_batches(&dir.join(WAL_FILE))? {
        if batch.generation != meta.generation {
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

    let mut rows: Vec<StoredRow> = by_url.into_values().collect();
    rows.sort_by(|a, b| a.url_rank.cmp(&b.url_rank).then_with(|| a.url.cmp(&b.url)));

    info!(rows = rows.len(), "upgrading table from version 2 to 3");
    let next = TableMeta::new(3, meta.generation + 1);
    table::write_table(&path, &next, &rows)?;
    wal::reset(&dir.join(WAL_FILE), sync)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn v2_row(url: &str, rank: i64) -> RowV2 {
        RowV2 {
            url: url.to_string(),
            url_rank: rank,
            title: format!("title of {url}"),
            thumbnail: vec![0xFF, 0xD8, 0xFF],
            redirects: vec![url.to_string()],
            boring_score: 0.25,
            good_clipping: true,
            at_top: true,
            last_updated: Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
            load_completed: true,
        }
    }

    #[test]
    fn test_creates_current_table() {
        let dir = tempdir().unwrap();
        let meta = migrate(dir.path(), false).unwrap();
        assert_eq!(meta.version, CURRENT_VERSION);

        let (_, rows) = table::read_table::<StoredRow>(&dir.path().join(TABLE_FILE)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_version1_upgrades_to_empty() {
        let dir = tempdir().unwrap();
        let legacy = vec![serde_json::json!({"url": "http://old/", "rank": 0})];
        table::write_table(&dir.path().join(TABLE_FILE), &TableMeta::new(1, 1), &legacy).unwrap();

        let meta = migrate(dir.path(), false).unwrap();
        assert_eq!(meta.version, CURRENT_VERSION);

        let (_, rows) = table::read_table::<StoredRow>(&dir.path().join(TABLE_FILE)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_version2_upgrade_keeps_ranks() {
        let dir = tempdir().unwrap();
        let legacy = vec![v2_row("http://b/", 1), v2_row("http://a/", 0), v2_row("http://c/", 2)];
        table::write_table(&dir.path().join(TABLE_FILE), &TableMeta::new(2, 4), &legacy).unwrap();

        let meta = migrate(dir.path(), false).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.generation, 5);

        let (_, rows) = table::read_table::<StoredRow>(&dir.path().join(TABLE_FILE)).unwrap();
        let ranked: Vec<_> = rows.iter().map(|r| (r.url.as_str(), r.url_rank)).collect();
        assert_eq!(ranked, [("http://a/", 0), ("http://b/", 1), ("http://c/", 2)]);
        assert!(rows.iter().all(|r| r.last_forced.is_none()));
        assert_eq!(rows[0].thumbnail, vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_upgrade_is_rerunnable() {
        let dir = tempdir().unwrap();
        table::write_table(&dir.path().join(TABLE_FILE), &TableMeta::new(2, 1), &[v2_row("http://a/", 0)])
            .unwrap();

        let first = migrate(dir.path(), false).unwrap();
        let second = migrate(dir.path(), false).unwrap();
        assert_eq!(first, second, "a current table is left alone");
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let dir = tempdir().unwrap();
        table::write_table::<StoredRow>(&dir.path().join(TABLE_FILE), &TableMeta::new(4, 1), &[]).unwrap();

        match migrate(dir.path(), false) {
            Err(StorageError::UnsupportedSchema { found, supported }) => {
                assert_eq!(found, 4);
                assert_eq!(supported, CURRENT_VERSION);
            }
            other => panic!("expected UnsupportedSchema, got {other:?}"),
        }
    }

    #[test]
    fn test_row_conversion_roundtrip_forced() {
        let since = Utc.timestamp_opt(789_714_000, 0).single().unwrap();
        let entry = SiteEntry::new("http://drive/", Rank::Forced { since }, SiteMetadata::titled("Drive"));
        let row = StoredRow::from(&entry);
        assert_eq!(row.url_rank, RANK_OF_FORCED_URL);
        assert_eq!(row.into_entry().unwrap(), entry);
    }

    #[test]
    fn test_non_finite_scores_survive_encoding() {
        for score in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.5] {
            let mut entry = SiteEntry::new("http://x/", Rank::Organic(0), SiteMetadata::default());
            entry.metadata.thumbnail.score.boring_score = score;

            let json = serde_json::to_vec(&StoredRow::from(&entry)).unwrap();
            let row: StoredRow = serde_json::from_slice(&json).unwrap();
            let back = row.into_entry().unwrap().metadata.thumbnail.score.boring_score;
            assert_eq!(back.to_bits(), score.to_bits(), "score {score}");
        }
    }

    #[test]
    fn test_garbage_score_text_is_rejected() {
        let mut value = serde_json::to_value(StoredRow::from(&SiteEntry::new(
            "http://x/",
            Rank::Organic(0),
            SiteMetadata::default(),
        )))
        .unwrap();
        value["boring_score"] = serde_json::json!("lots");
        assert!(serde_json::from_value::<StoredRow>(value).is_err());
    }

    #[test]
    fn test_forced_rank_without_time_is_rejected() {
        let mut row = StoredRow::from(&SiteEntry::new("http://x/", Rank::Organic(0), SiteMetadata::default()));
        row.url_rank = RANK_OF_FORCED_URL;
        assert!(row.into_entry().is_err());
    }
}
