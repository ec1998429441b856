//! Write-ahead log of row batches.
//!
//! Every atomic batch is one codec frame, so a batch is either fully on
//! disk or (after a torn write) not there at all.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [BATCH 1: codec-encoded WalBatch]
//! [BATCH 2: codec-encoded WalBatch]
//! ...
//! ```
//!
//! A trailing frame cut short by a crash is a batch that never committed;
//! it is trimmed when the log is opened. Damage anywhere else is corruption.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Seek, Write};
use std::mem;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::codec::{self, RawFrame};
use super::schema::StoredRow;
use crate::storage::traits::StorageError;

/// File name of the log inside a store directory.
pub const WAL_FILE: &str = "topsites.wal";

/// One row mutation as logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    Upsert(StoredRow),
    Delete { url: String },
}

/// One atomic batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalBatch {
    /// Table generation this batch applies to.
    pub generation: u64,
    /// Monotonically increasing within a log.
    pub sequence: u64,
    /// When the batch was written.
    pub timestamp: DateTime<Utc>,
    /// Mutations, applied in order.
    pub ops: Vec<WalOp>,
}

fn corrupt(path: &Path, detail: impl Into<String>) -> StorageError {
    StorageError::corruption(path.display().to_string(), detail)
}

/// Result of scanning a log file.
struct Scan {
    batches: Vec<WalBatch>,
    /// Offset just past the last complete frame.
    valid_len: u64,
    file_len: u64,
}

/// Strict scan: damage before the tail is an error, a torn tail is not.
fn scan(path: &Path) -> Result<Scan, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Scan { batches: Vec::new(), valid_len: 0, file_len: 0 });
        }
        Err(e) => return Err(StorageError::io("log open", e)),
    };
    let file_len = file.metadata().map_err(|e| StorageError::io("log stat", e))?.len();
    if file_len < codec::HEADER_LEN {
        // Reset was interrupted before the header landed.
        return Ok(Scan { batches: Vec::new(), valid_len: 0, file_len });
    }
    let mut reader = BufReader::new(file);

    codec::read_header(&mut reader).map_err(|e| corrupt(path, e.to_string()))?;

    let mut batches = Vec::new();
    let mut valid_len = codec::HEADER_LEN;
    loop {
        if valid_len >= file_len {
            break;
        }
        match codec::read_frame(&mut reader) {
            Ok(RawFrame::Intact(data)) => {
                let batch: WalBatch = codec::parse(&data).map_err(|e| corrupt(path, e.to_string()))?;
                batches.push(batch);
                valid_len = reader
                    .stream_position()
                    .map_err(|e| StorageError::io("log seek", e))?;
            }
            Ok(RawFrame::Damaged { reason }) => {
                return Err(corrupt(path, format!("batch after offset {valid_len}: {reason}")));
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(corrupt(path, format!("framing lost after offset {valid_len}: {e}")));
            }
            Err(e) => return Err(StorageError::io("log read", e)),
        }
    }

    Ok(Scan { batches, valid_len, file_len })
}

/// Read every committed batch, failing on damage.
pub fn read_batches(path: &Path) -> Result<Vec<WalBatch>, StorageError> {
    Ok(scan(path)?.batches)
}

/// Read every batch that still decodes, skipping damaged ones.
///
/// Returns the batches and how many frames were skipped.
pub fn salvage_batches(path: &Path) -> Result<(Vec<WalBatch>, usize), StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(StorageError::io("log salvage", e)),
    };
    let mut reader = BufReader::new(file);
    if codec::read_header(&mut reader).is_err() {
        warn!(path = %path.display(), "log header unreadable, nothing to salvage");
        return Ok((Vec::new(), 0));
    }

    let mut batches = Vec::new();
    let mut skipped = 0;
    loop {
        match codec::read_frame(&mut reader) {
            Ok(RawFrame::Intact(data)) => match codec::parse::<WalBatch>(&data) {
                Ok(batch) => batches.push(batch),
                Err(_) => skipped += 1,
            },
            Ok(RawFrame::Damaged { .. }) => skipped += 1,
            Err(e) if matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::InvalidData) => break,
            Err(e) => return Err(StorageError::io("log salvage", e)),
        }
    }
    Ok((batches, skipped))
}

/// Replace the log at `path` with an empty one.
pub fn reset(path: &Path, sync: bool) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| StorageError::io("log reset", e))?;
    codec::write_header(&mut file).map_err(|e| StorageError::io("log reset", e))?;
    if sync {
        file.sync_all().map_err(|e| StorageError::io("log sync", e))?;
    }
    Ok(())
}

/// Append handle on the log.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    sequence: u64,
    sync_on_write: bool,
    /// Length to cut back to before the next append.
    pending_rollback: Option<u64>,
}

impl WriteAheadLog {
    /// Open the log, creating it if missing and trimming a torn tail.
    pub fn open(path: &Path, sync_on_write: bool) -> Result<Self, StorageError> {
        if !path.exists() {
            reset(path, sync_on_write)?;
        }

        let scan = scan(path)?;
        if scan.valid_len < codec::HEADER_LEN {
            reset(path, sync_on_write)?;
        } else if scan.valid_len < scan.file_len {
            warn!(
                path = %path.display(),
                kept = scan.valid_len,
                dropped = scan.file_len - scan.valid_len,
                "trimming torn batch at end of log"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| StorageError::io("log trim", e))?;
            file.set_len(scan.valid_len)
                .map_err(|e| StorageError::io("log trim", e))?;
            file.sync_all().map_err(|e| StorageError::io("log trim", e))?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io("log open", e))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            sequence: scan.batches.last().map_or(0, |b| b.sequence),
            sync_on_write,
            pending_rollback: None,
        })
    }

    /// Append one batch. Returns its sequence number.
    pub fn append(&mut self, generation: u64, ops: Vec<WalOp>) -> Result<u64, StorageError> {
        let batch = WalBatch {
            generation,
            sequence: self.sequence + 1,
            timestamp: Utc::now(),
            ops,
        };
        let encoded = codec::encode(&batch).map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(len) = self.pending_rollback {
            self.rollback(len)?;
        }
        let start = self
            .writer
            .get_ref()
            .metadata()
            .map_err(|e| StorageError::io("log stat", e))?
            .len();

        if let Err(e) = self.write_frame(&encoded) {
            warn!(path = %self.path.display(), error = %e, "log append failed, rolling back");
            self.pending_rollback = Some(start);
            self.rollback(start)?;
            return Err(e);
        }

        self.sequence = batch.sequence;
        Ok(batch.sequence)
    }

    fn write_frame(&mut self, encoded: &[u8]) -> Result<(), StorageError> {
        self.writer
            .write_all(encoded)
            .and_then(|()| self.writer.flush())
            .map_err(|e| StorageError::io("log append", e))?;
        if self.sync_on_write {
            self.writer
                .get_ref()
                .sync_all()
                .map_err(|e| StorageError::io("log sync", e))?;
        }
        Ok(())
    }

    /// Cut the log back to `len`, discarding anything a failed append left
    /// on disk or in the buffer.
    ///
    /// Stays pending until it succeeds; no batch is appended after a torn one.
    fn rollback(&mut self, len: u64) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io("log rollback", e))?;
        // into_parts hands back the file without flushing the torn bytes.
        let (old, _unwritten) = mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        drop(old);

        let file = self.writer.get_ref();
        file.set_len(len)
            .map_err(|e| StorageError::io("log rollback", e))?;
        if self.sync_on_write {
            file.sync_all().map_err(|e| StorageError::io("log rollback", e))?;
        }
        self.pending_rollback = None;
        Ok(())
    }

    /// All committed batches.
    pub fn batches(&self) -> Result<Vec<WalBatch>, StorageError> {
        read_batches(&self.path)
    }

    /// Sequence number of the last appended batch.
    pub fn current_sequence(&self) -> u64 {
        self.sequence
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map_or(0, |m| m.len())
    }

    /// Empty the log after its batches were folded into the table.
    pub fn truncate(&mut self) -> Result<(), StorageError> {
        if self.pending_rollback.is_none() {
            self.writer
                .flush()
                .map_err(|e| StorageError::io("log flush", e))?;
        }
        reset(&self.path, self.sync_on_write)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io("log open", e))?;
        // Dropping the old writer must not flush torn bytes into the new log.
        let (_old, _unwritten) = mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.sequence = 0;
        self.pending_rollback = None;
        Ok(())
    }
}
