//! Binary framing for the table and log files.
//!
//! Every record is serialized with:
//! - JSON for data (so row layouts can evolve through serde attributes)
//! - Length-prefixed framing
//! - CRC32 checksum for corruption detection
//! - Version byte for forward compatibility
//!
//! Two read paths exist. [`decode`] is strict and fails on any damage.
//! [`read_frame`] separates "this frame is damaged but its length is
//! trustworthy" from "framing is lost", which is what the salvage pass needs
//! to skip bad rows and keep reading.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying top sites files.
pub const MAGIC: [u8; 4] = *b"TOPS";

/// Size of the file header (magic + codec version).
pub const HEADER_LEN: u64 = 5;

/// Largest frame payload accepted (100 MiB).
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes a value to a checksummed frame.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "frame too large"))?;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// One frame as read from disk.
#[derive(Debug)]
pub enum RawFrame {
    /// Checksum matched.
    Intact(Vec<u8>),
    /// Framing was readable but the payload failed its checksum.
    Damaged {
        /// Why the frame was rejected.
        reason: String,
    },
}

/// Reads one frame without interpreting its payload.
///
/// # Errors
/// - `UnexpectedEof` if the input ends inside the frame
/// - `InvalidData` if the version byte or length is unusable (framing lost)
pub fn read_frame(reader: &mut impl Read) -> IoResult<RawFrame> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);

    if stored != computed {
        return Ok(RawFrame::Damaged {
            reason: format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        });
    }
    Ok(RawFrame::Intact(data))
}

/// Parses an intact payload.
pub fn parse<T: DeserializeOwned>(data: &[u8]) -> IoResult<T> {
    serde_json::from_slice(data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Reads and deserializes one frame, verifying its checksum.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    match read_frame(reader)? {
        RawFrame::Intact(data) => parse(&data),
        RawFrame::Damaged { reason } => Err(IoError::new(
            ErrorKind::InvalidData,
            format!("{reason} (data corrupted)"),
        )),
    }
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported file codec version {}", version[0]),
        ));
    }
    Ok(version[0])
}
