//! Hash-partitioned, append-only key-value store.
//!
//! Keys are spread over a fixed number of partitions by hashing their encoded
//! bytes. Each partition owns one log file, `partition_{i}.dat` under the
//! storage directory, and an in-memory cache of entries it has written or
//! read back.
//!
//! # Invariants
//!
//! - Logs only grow. A record is never rewritten or removed, so inserting a
//!   key twice leaves two records.
//! - `get` on a cache miss returns the *first* matching record in the log.
//!   After a key has been stored with two different values, a store opened
//!   fresh over the same directory returns the older one.
//! - The cache update and the append happen under the partition mutex, so
//!   they are atomic as a pair. Distinct partitions never contend.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::codec::{Codec, CodecError};
use crate::storage::record::{LogRecord, MAX_RECORD_PAYLOAD, RecordReader};

/// Partition index for an encoded key.
#[must_use]
pub fn partition_for(key_bytes: &[u8], num_partitions: usize) -> usize {
    crc32fast::hash(key_bytes) as usize % num_partitions
}

/// Path of the log file for partition `index`.
#[must_use]
pub fn partition_path(storage_path: &Path, index: usize) -> PathBuf {
    storage_path.join(format!("partition_{index}.dat"))
}

/// One shard of the store.
struct Partition<K, V> {
    index: usize,
    path: PathBuf,
    /// Append handle for the log.
    log: File,
    /// Length of the log up to the end of the last complete record.
    len: u64,
    /// Latest value written or read back per key. Nothing is evicted, so it
    /// grows with the number of distinct keys the partition has seen.
    cache: HashMap<K, V>,
}

impl<K, V> Partition<K, V> {
    /// Open or create the log for partition `index`, dropping a torn tail
    /// left by an interrupted append.
    fn open(storage_path: &Path, index: usize) -> Result<Self, StoreError> {
        let path = partition_path(storage_path, index);
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let file_len = log.metadata()?.len();
        let mut reader = RecordReader::new(BufReader::new(File::open(&path)?), index);
        let mut records = 0u64;
        while reader.next_record()?.is_some() {
            records += 1;
        }

        let len = reader.offset();
        if reader.hit_torn_tail() {
            tracing::warn!(
                "partition {index}: truncating torn tail ({} bytes after offset {len})",
                file_len - len
            );
            log.set_len(len)?;
        }
        tracing::debug!("partition {index}: {records} records, {len} bytes");

        Ok(Self {
            index,
            path,
            log,
            len,
            cache: HashMap::new(),
        })
    }

    /// Append one serialized record.
    ///
    /// A failed write is cut back to the previous record boundary so later
    /// appends stay readable.
    fn append(&mut self, record: &[u8], sync: bool) -> Result<(), StoreError> {
        let written = self.log.write_all(record).and_then(|()| {
            if sync {
                self.log.sync_data()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(truncate_err) = self.log.set_len(self.len) {
                    tracing::warn!(
                        "partition {}: failed to cut back partial append: {truncate_err}",
                        self.index
                    );
                }
                Err(StoreError::Io(e))
            }
        }
    }

    /// Scan the log from the beginning for the first record with this key.
    fn find_first(&self, key_bytes: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let file = File::open(&self.path)?;
        let mut reader = RecordReader::new(BufReader::new(file.take(self.len)), self.index);
        while let Some(record) = reader.next_record()? {
            if record.key == key_bytes {
                return Ok(Some(record.value));
            }
        }
        Ok(None)
    }
}

/// A store that hash-partitions keys across independent append-only logs.
pub struct PartitionStore<K, V> {
    storage_path: PathBuf,
    sync_on_append: bool,
    partitions: Vec<Mutex<Partition<K, V>>>,
}

impl<K, V> PartitionStore<K, V>
where
    K: Codec + Eq + Hash + Clone,
    V: Codec + Clone,
{
    /// Open the store at `storage_path`, creating the directory and any
    /// missing partition logs.
    ///
    /// # Panics
    /// Panics if `num_partitions` is 0.
    pub fn open(
        num_partitions: usize,
        storage_path: &Path,
        sync_on_append: bool,
    ) -> Result<Self, StoreError> {
        assert!(num_partitions > 0, "partition count must be positive");

        std::fs::create_dir_all(storage_path)?;
        let partitions = (0..num_partitions)
            .map(|index| Partition::open(storage_path, index).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "opened partition store at {} with {num_partitions} partitions",
            storage_path.display()
        );

        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            sync_on_append,
            partitions,
        })
    }

    /// Number of partitions, fixed at open.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Directory holding the partition logs.
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Partition that owns `key`.
    #[must_use]
    pub fn partition_of(&self, key: &K) -> usize {
        partition_for(&key.to_bytes(), self.partitions.len())
    }

    /// Cache `key -> value` and append the pair to the owning partition log.
    ///
    /// The append is unconditional: storing a key again adds another record.
    /// A pair whose encoded size exceeds the record limit is refused with
    /// [`StoreError::RecordTooLarge`] and leaves the log untouched.
    pub fn insert(&self, key: &K, value: &V) -> Result<(), StoreError> {
        let key_bytes = key.to_bytes();
        let value_bytes = value.to_bytes();
        let index = partition_for(&key_bytes, self.partitions.len());
        let Some(record) = LogRecord::encode(&key_bytes, &value_bytes) else {
            return Err(StoreError::RecordTooLarge {
                partition: index,
                len: key_bytes.len() + value_bytes.len(),
            });
        };

        let mut partition = self.lock(index);
        partition.append(&record, self.sync_on_append)?;
        partition.cache.insert(key.clone(), value.clone());
        Ok(())
    }

    /// Look up `key`, serving from the cache and falling back to a scan of
    /// the partition log.
    ///
    /// A value found on disk is cached before it is returned.
    pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let key_bytes = key.to_bytes();
        let index = partition_for(&key_bytes, self.partitions.len());

        let mut partition = self.lock(index);
        if let Some(value) = partition.cache.get(key) {
            return Ok(Some(value.clone()));
        }

        let Some(value_bytes) = partition.find_first(&key_bytes)? else {
            return Ok(None);
        };
        let value = V::decode(&value_bytes)?;
        partition.cache.insert(key.clone(), value.clone());
        Ok(Some(value))
    }

    /// Whether the partition cache already holds exactly `value` for `key`.
    pub fn is_cached(&self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        let index = self.partition_of(key);
        self.lock(index).cache.get(key) == Some(value)
    }

    /// Every record of one partition, in log order.
    ///
    /// # Panics
    /// Panics if `index` is not a partition of this store.
    pub fn scan_partition(&self, index: usize) -> Result<Vec<(K, V)>, StoreError> {
        let partition = self.lock(index);
        let file = File::open(&partition.path)?;
        let mut reader = RecordReader::new(BufReader::new(file.take(partition.len)), index);

        let mut entries = Vec::new();
        while let Some(record) = reader.next_record()? {
            entries.push((K::decode(&record.key)?, V::decode(&record.value)?));
        }
        Ok(entries)
    }

    /// Flush every partition log to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        for index in 0..self.partitions.len() {
            self.lock(index).log.sync_data()?;
        }
        Ok(())
    }

    /// Swap the append handle of partition `index` for a read-only one so
    /// every append fails until [`Self::reopen_log`].
    #[cfg(test)]
    pub(crate) fn make_log_read_only(&self, index: usize) -> Result<(), StoreError> {
        let mut partition = self.lock(index);
        partition.log = File::open(&partition.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn reopen_log(&self, index: usize) -> Result<(), StoreError> {
        let mut partition = self.lock(index);
        partition.log = OpenOptions::new().append(true).open(&partition.path)?;
        Ok(())
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self, index: usize) -> MutexGuard<'_, Partition<K, V>> {
        self.partitions[index]
            .lock()
            .expect("partition lock poisoned")
    }
}

/// Errors that can occur during partition store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// A stored key or value could not be decoded.
    Codec(CodecError),
    /// A complete record failed its checksum.
    ChecksumMismatch {
        partition: usize,
        offset: u64,
        expected: u32,
        actual: u32,
    },
    /// A record header is not plausible (length out of range).
    CorruptRecord { partition: usize, offset: u64 },
    /// A key/value payload too large to be stored as one record.
    RecordTooLarge { partition: usize, len: usize },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::ChecksumMismatch {
                partition,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "partition {partition} checksum mismatch at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::CorruptRecord { partition, offset } => {
                write!(f, "partition {partition} corrupt record at offset {offset}")
            }
            Self::RecordTooLarge { partition, len } => write!(
                f,
                "partition {partition} record of {len} bytes exceeds the {MAX_RECORD_PAYLOAD} byte limit"
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
