//! Buffered B-tree.
//!
//! An order-preserving index whose nodes stage writes in per-node buffers
//! before they are drained into the partition store.
//!
//! # Structure
//!
//! - Every node holds entries; internal nodes also hold `keys.len() + 1`
//!   children. A split promotes the middle entry into the parent.
//! - Nodes live in an arena and refer to each other by id, including the
//!   parent back-reference.
//! - A node splits once it holds more than `buffer_size` keys and a
//!   non-root node underflows below `buffer_size / 2`.
//!
//! # Synchronization
//!
//! See [`SyncStrategy`]. Both strategies are safe to use from many threads
//! through a shared `&BufferedBTree`.
//!
//! # Usage
//!
//! ```no_run
//! use bufferdb::BufferedBTree;
//!
//! let tree: BufferedBTree<u64, String> = BufferedBTree::new(3, 4, "./data")?;
//! tree.insert(7, "seven".to_string())?;
//! assert_eq!(tree.search(&7)?, Some("seven".to_string()));
//! tree.flush()?;
//! # Ok::<(), bufferdb::TreeError>(())
//! ```

mod buffer;
mod invariants;
mod latch;
mod node;
mod rebalance;
mod sync;
mod tree;

pub use invariants::NodeImage;
pub use node::NodeId;
pub use sync::SyncStrategy;
pub use tree::{BufferedBTree, IndexKey, IndexValue, TreeError};
