//! The table file: meta row plus one framed record per entry row.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [TableMeta: codec frame]
//! [ROW 1: codec frame]
//! [ROW 2: codec frame]
//! ...
//! ```
//!
//! The table is never modified in place. Every rewrite (compaction, schema
//! upgrade, salvage) goes through [`TableWriter`], which writes a temp file,
//! fsyncs it and renames it over the old table.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::codec::{self, RawFrame};
use crate::storage::traits::StorageError;

/// File name of the table inside a store directory.
pub const TABLE_FILE: &str = "topsites.tbl";

/// The meta row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Schema version of the rows that follow.
    pub version: u32,
    /// Bumped on every rewrite; log batches from other generations are stale.
    pub generation: u64,
    /// Number of rows written after the meta row.
    pub row_count: u64,
    /// When this table file was written.
    pub created_at: DateTime<Utc>,
}

impl TableMeta {
    /// Meta for a fresh table at `version`.
    #[must_use]
    pub fn new(version: u32, generation: u64) -> Self {
        Self {
            version,
            generation,
            row_count: 0,
            created_at: Utc::now(),
        }
    }
}

fn corrupt(path: &Path, e: &std::io::Error) -> StorageError {
    StorageError::corruption(path.display().to_string(), e.to_string())
}

fn read_err(path: &Path, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => corrupt(path, &e),
        _ => StorageError::io("table read", e),
    }
}

fn open_reader(path: &Path) -> Result<BufReader<File>, StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io("table open", e))?;
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader).map_err(|e| read_err(path, e))?;
    Ok(reader)
}

/// Read only the meta row.
pub fn read_meta(path: &Path) -> Result<TableMeta, StorageError> {
    let mut reader = open_reader(path)?;
    codec::decode(&mut reader).map_err(|e| read_err(path, e))
}

/// Read the meta row and every row, failing on any damage.
///
/// A row count that disagrees with the meta row is damage too: it means
/// the file was cut short or grew garbage.
pub fn read_table<R: DeserializeOwned>(path: &Path) -> Result<(TableMeta, Vec<R>), StorageError> {
    let mut reader = open_reader(path)?;
    let meta: TableMeta = codec::decode(&mut reader).map_err(|e| read_err(path, e))?;

    let mut rows = Vec::with_capacity(usize::try_from(meta.row_count).unwrap_or(0).min(1024));
    for _ in 0..meta.row_count {
        rows.push(codec::decode(&mut reader).map_err(|e| read_err(path, e))?);
    }

    match codec::read_frame(&mut reader) {
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok((meta, rows)),
        Err(e) => Err(read_err(path, e)),
        Ok(_) => Err(StorageError::corruption(
            path.display().to_string(),
            format!("trailing rows beyond declared count {}", meta.row_count),
        )),
    }
}

/// What the salvage reader could get out of a damaged table.
#[derive(Debug)]
pub struct SalvagedTable<R> {
    /// The meta row, if it was readable.
    pub meta: Option<TableMeta>,
    /// Rows that decoded, in file order.
    pub rows: Vec<R>,
    /// Frames that were present but unreadable.
    pub skipped: usize,
}

/// Read every row that can still be decoded.
///
/// Damaged frames are skipped as long as framing holds; reading stops at
/// the first frame whose header is unusable. Only failures of the medium
/// itself are returned as errors.
pub fn salvage_table<R: DeserializeOwned>(path: &Path) -> Result<SalvagedTable<R>, StorageError> {
    let mut out = SalvagedTable {
        meta: None,
        rows: Vec::new(),
        skipped: 0,
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StorageError::io("table salvage", e)),
    };
    let mut reader = BufReader::new(file);
    if let Err(e) = codec::read_header(&mut reader) {
        if !matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) {
            return Err(StorageError::io("table salvage", e));
        }
        warn!(path = %path.display(), error = %e, "table header unreadable, nothing to salvage");
        return Ok(out);
    }

    let mut first = true;
    loop {
        let frame = match codec::read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) => {
                break;
            }
            Err(e) => return Err(StorageError::io("table salvage", e)),
        };

        if first {
            first = false;
            if let RawFrame::Intact(data) = &frame {
                if let Ok(meta) = codec::parse::<TableMeta>(data) {
                    out.meta = Some(meta);
                    continue;
                }
            }
            // The first frame is either the meta row or, if the meta row
            // is lost, possibly a row; try it as a row below.
        }

        match frame {
            RawFrame::Intact(data) => match codec::parse::<R>(&data) {
                Ok(row) => out.rows.push(row),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable row");
                    out.skipped += 1;
                }
            },
            RawFrame::Damaged { reason } => {
                warn!(path = %path.display(), %reason, "skipping damaged row");
                out.skipped += 1;
            }
        }
    }

    Ok(out)
}

/// Builder for writing table files atomically.
///
/// Uses write-to-temp-then-rename for crash safety.
pub struct TableWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TableWriter {
    /// Start a new table that will replace `final_path` on finalize.
    pub fn new(final_path: &Path) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("tbl.tmp.{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path: final_path.to_path_buf(),
            writer: Some(writer),
        })
    }

    /// Write the meta row followed by `rows`.
    ///
    /// `meta.row_count` is overwritten with the actual number of rows.
    pub fn write<R: Serialize>(&mut self, meta: &TableMeta, rows: &[R]) -> IoResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(ErrorKind::Other, "writer already consumed")
        })?;

        let meta = TableMeta {
            row_count: rows.len() as u64,
            ..meta.clone()
        };
        writer.write_all(&codec::encode(&meta)?)?;
        for row in rows {
            writer.write_all(&codec::encode(row)?)?;
        }
        Ok(())
    }

    /// Flush, fsync and rename over the final path.
    ///
    /// This is the commit point for the new table.
    pub fn finalize(mut self) -> IoResult<()> {
        let mut writer = self.writer.take().ok_or_else(|| {
            std::io::Error::new(ErrorKind::Other, "writer already consumed")
        })?;
        let temp_path = self.temp_path.take().ok_or_else(|| {
            std::io::Error::new(ErrorKind::Other, "temp_path already consumed")
        })?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir);
        }
        Ok(())
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Atomically replace the table at `path`.
pub fn write_table<R: Serialize>(path: &Path, meta: &TableMeta, rows: &[R]) -> Result<(), StorageError> {
    let mut writer = TableWriter::new(path).map_err(|e| StorageError::io("table create", e))?;
    writer
        .write(meta, rows)
        .map_err(|e| StorageError::io("table write", e))?;
    writer
        .finalize()
        .map_err(|e| StorageError::io("table commit", e))
}

/// Remove temp files left by an interrupted rewrite.
pub fn remove_stale_temps(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".tbl.tmp."));
        if is_temp {
            let _ = fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        let rows = vec!["a".to_string(), "b".to_string()];

        write_table(&path, &TableMeta::new(3, 7), &rows).unwrap();

        let (meta, read): (TableMeta, Vec<String>) = read_table(&path).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.generation, 7);
        assert_eq!(meta.row_count, 2);
        assert_eq!(read, rows);
        assert_eq!(read_meta(&path).unwrap().generation, 7);
    }

    #[test]
    fn test_truncated_table_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        write_table(&path, &TableMeta::new(3, 1), &["row-one".to_string(), "row-two".to_string()]).unwrap();

        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let err = read_table::<String>(&path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_salvage_skips_damaged_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        let rows: Vec<String> = (0..3).map(|i| format!("row-{i}")).collect();
        write_table(&path, &TableMeta::new(3, 1), &rows).unwrap();

        // Flip a byte inside the second row's payload.
        let mut bytes = fs::read(&path).unwrap();
        let needle = b"row-1";
        let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap();
        bytes[at] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(read_table::<String>(&path).unwrap_err().is_corruption());

        let salvaged: SalvagedTable<String> = salvage_table(&path).unwrap();
        assert_eq!(salvaged.meta.unwrap().generation, 1);
        assert_eq!(salvaged.rows, ["row-0", "row-2"]);
        assert_eq!(salvaged.skipped, 1);
    }

    #[test]
    fn test_salvage_missing_table() {
        let dir = tempdir().unwrap();
        let salvaged: SalvagedTable<String> = salvage_table(&dir.path().join(TABLE_FILE)).unwrap();
        assert!(salvaged.meta.is_none());
        assert!(salvaged.rows.is_empty());
    }

    #[test]
    fn test_dropped_writer_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        let writer = TableWriter::new(&path).unwrap();
        let temp = writer.temp_path.clone().unwrap();
        assert!(temp.exists());
        drop(writer);
        assert!(!temp.exists());
        assert!(!path.exists());
    }
}
