//! Partition log record format.
//!
//! A partition log is a plain concatenation of records. There is no file
//! header; the first record starts at offset 0.
//!
//! # Record Format
//!
//! ```text
//! +----------+------------------------------------------------+
//! | 0-3      | key_len (4 bytes, little endian)               |
//! | 4-7      | value_len (4 bytes, little endian)             |
//! | 8-N      | key bytes (key_len)                            |
//! | N-M      | value bytes (value_len)                        |
//! | M-M+3    | CRC32 checksum (4 bytes) over everything above |
//! +----------+------------------------------------------------+
//! ```
//!
//! End of file exactly on a record boundary ends a scan normally. A record
//! that is cut short by the end of the file (a torn append) also ends the
//! scan; the reader remembers that it stopped on a torn tail so the store can
//! truncate it on open.

// Lengths fit in u32 once checked against MAX_RECORD_PAYLOAD
#![allow(clippy::cast_possible_truncation)]

use std::io::{ErrorKind, Read};

use crate::storage::partition::StoreError;

/// Length prefix size: `key_len` (4) + `value_len` (4).
pub const RECORD_HEADER_SIZE: usize = 8;

/// CRC32 checksum size at end of record.
pub const CHECKSUM_SIZE: usize = 4;

/// Largest key + value payload accepted in a single record (64MB).
/// Writers refuse larger payloads; on read, length prefixes above this are
/// treated as corruption rather than allocated.
pub const MAX_RECORD_PAYLOAD: usize = 64 * 1024 * 1024;

/// A decoded log record: raw key and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::disallowed_methods)] // Clone needed by scan results
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Total serialized size of a record with the given field sizes.
    #[must_use]
    pub const fn serialized_size(key_len: usize, value_len: usize) -> usize {
        RECORD_HEADER_SIZE + key_len + value_len + CHECKSUM_SIZE
    }

    /// Serialize a record from encoded key and value bytes.
    ///
    /// Returns `None` if the payload exceeds [`MAX_RECORD_PAYLOAD`], since a
    /// reader would reject such a record.
    #[must_use]
    pub fn encode(key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        if key.len().saturating_add(value.len()) > MAX_RECORD_PAYLOAD {
            return None;
        }
        let mut bytes = Vec::with_capacity(Self::serialized_size(key.len(), value.len()));

        bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(value);

        // CRC32 checksum (4 bytes) - computed over everything before it
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        Some(bytes)
    }
}

/// Sequential reader over the records of one partition log.
pub struct RecordReader<R: Read> {
    reader: R,
    partition: usize,
    /// Offset just past the last complete, verified record.
    offset: u64,
    torn_tail: bool,
}

impl<R: Read> RecordReader<R> {
    #[must_use]
    pub const fn new(reader: R, partition: usize) -> Self {
        Self {
            reader,
            partition,
            offset: 0,
            torn_tail: false,
        }
    }

    /// Byte offset of the end of the last complete record read so far.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the scan ended on a partially written record.
    #[must_use]
    pub const fn hit_torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` at end of log, including a torn tail.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, StoreError> {
        if self.torn_tail {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let read = read_up_to(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < RECORD_HEADER_SIZE {
            self.torn_tail = true;
            return Ok(None);
        }

        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let value_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if key_len + value_len > MAX_RECORD_PAYLOAD {
            return Err(StoreError::CorruptRecord {
                partition: self.partition,
                offset: self.offset,
            });
        }

        let mut body = vec![0u8; key_len + value_len + CHECKSUM_SIZE];
        if read_up_to(&mut self.reader, &mut body)? < body.len() {
            self.torn_tail = true;
            return Ok(None);
        }

        let checksum_at = key_len + value_len;
        let stored = u32::from_le_bytes([
            body[checksum_at],
            body[checksum_at + 1],
            body[checksum_at + 2],
            body[checksum_at + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&body[..checksum_at]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                partition: self.partition,
                offset: self.offset,
                expected: stored,
                actual: computed,
            });
        }

        body.truncate(checksum_at);
        let value = body.split_off(key_len);
        self.offset += LogRecord::serialized_size(key_len, value_len) as u64;

        Ok(Some(LogRecord { key: body, value }))
    }
}

/// Fill `buf` from `reader`, stopping early only at end of file.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
