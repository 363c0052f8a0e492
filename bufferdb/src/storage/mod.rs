//! Durable tier of the index.
//!
//! Node buffers drain into a [`PartitionStore`]: a fixed set of append-only
//! logs selected by hashing the key, each fronted by an in-memory cache.
//!
//! # File Layout
//!
//! ```text
//! {storage_path}/partition_0.dat
//! {storage_path}/partition_1.dat
//! ...
//! {storage_path}/partition_{N-1}.dat
//! ```
//!
//! Each file is a sequence of framed records; see [`record`] for the format.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use bufferdb::storage::PartitionStore;
//!
//! let store: PartitionStore<u64, String> =
//!     PartitionStore::open(4, Path::new("./data"), false)?;
//! store.insert(&7, &"seven".to_string())?;
//! assert_eq!(store.get(&7)?, Some("seven".to_string()));
//! # Ok::<(), bufferdb::storage::StoreError>(())
//! ```

mod partition;
pub mod record;

pub use partition::{PartitionStore, StoreError, partition_for, partition_path};
