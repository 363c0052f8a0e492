// Layers, bottom up:
//  - codec: keys and values to bytes
//  - storage: hash-partitioned append-only logs with per-partition caches
//  - btree: the buffered B-tree, its node arena and synchronization
//  - config: settings for all of the above
//
// Writes land in node buffers first; flush() drains them to storage.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod btree;
pub mod codec;
pub mod config;
pub mod storage;

pub use btree::{BufferedBTree, SyncStrategy, TreeError};
pub use config::{ConfigError, IndexConfig};
