//! The buffered B-tree.
//!
//! Entries live in every node, not only in leaves: a split promotes the
//! middle entry into the parent and that entry stays searchable there. Each
//! node also stages its entries in a write buffer that [`BufferedBTree::flush`]
//! drains into the [`PartitionStore`].
//!
//! Operations are written once against the optimistic protocol in
//! [`sync`](crate::btree::sync). Under [`SyncStrategy::Coarse`] each
//! operation additionally holds a tree-wide reader/writer lock, which turns
//! the same code into fully serialized mutation.

use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::btree::latch::{DEFAULT_SPIN_LIMIT, VersionLatch};
use crate::btree::node::{Node, NodeArena, NodeBody, NodeId};
use crate::btree::sync::{
    Attempt, Interrupt, SyncStrategy, WriteSession, backoff, root_of, stable, validate,
};
use crate::codec::Codec;
use crate::config::{ConfigError, IndexConfig};
use crate::storage::{PartitionStore, StoreError};

/// Requirements on tree keys.
pub trait IndexKey: Ord + Hash + Clone + Debug + Codec + Send + Sync {}

impl<T> IndexKey for T where T: Ord + Hash + Clone + Debug + Codec + Send + Sync {}

/// Requirements on tree values.
pub trait IndexValue: Clone + PartialEq + Debug + Codec + Send + Sync {}

impl<T> IndexValue for T where T: Clone + PartialEq + Debug + Codec + Send + Sync {}

/// An order-preserving index whose nodes buffer writes for a partition store.
pub struct BufferedBTree<K, V> {
    pub(super) config: IndexConfig,
    pub(super) arena: NodeArena<K, V>,
    /// Id of the root node, `usize::MAX` while the tree is empty.
    pub(super) root: AtomicUsize,
    /// Guards changes to `root`.
    pub(super) root_latch: VersionLatch,
    /// Tree-wide lock used only by [`SyncStrategy::Coarse`].
    coarse: RwLock<()>,
    pub(super) store: PartitionStore<K, V>,
    len: AtomicUsize,
}

/// Where a descent stopped.
pub(super) struct Located<K, V> {
    pub node: Arc<Node<K, V>>,
    /// Version the node had when it was reached. Nothing about the node is
    /// trustworthy until this is validated or upgraded.
    pub version: u64,
    /// Position of the key in `node`, if present.
    pub position: Option<usize>,
}

#[allow(dead_code)] // held for its Drop
pub(super) enum CoarseGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl<K: IndexKey, V: IndexValue> BufferedBTree<K, V> {
    /// Open a tree over `storage_path` with the default synchronization
    /// strategy.
    pub fn new(
        buffer_size: usize,
        num_partitions: usize,
        storage_path: impl Into<PathBuf>,
    ) -> Result<Self, TreeError> {
        Self::with_config(IndexConfig::new(buffer_size, num_partitions, storage_path))
    }

    /// Open a tree with an explicit configuration.
    ///
    /// The tree always starts empty. Existing partition logs are kept and
    /// remain readable through [`BufferedBTree::store`].
    pub fn with_config(config: IndexConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let store = PartitionStore::open(
            config.num_partitions,
            &config.storage_path,
            config.sync_on_append,
        )?;
        tracing::debug!(
            "created buffered b-tree: buffer_size={}, strategy={}",
            config.buffer_size,
            config.strategy
        );

        Ok(Self {
            config,
            arena: NodeArena::new(),
            root: AtomicUsize::new(usize::MAX),
            root_latch: VersionLatch::new(),
            coarse: RwLock::new(()),
            store,
            len: AtomicUsize::new(0),
        })
    }

    /// Insert `key -> value`.
    ///
    /// Inserting a key that is already present adds a second entry after
    /// the existing one; it does not overwrite. If the target node's buffer
    /// outgrows the buffer size it is drained to the store right away, and
    /// an error from that drain is returned after the entry is in the tree.
    pub fn insert(&self, key: K, value: V) -> Result<(), TreeError> {
        let _guard = self.enter(true);
        self.run("insert", || self.insert_attempt(&key, &value))
    }

    /// Look up `key` in the in-memory tree.
    ///
    /// The partition store is never consulted.
    pub fn search(&self, key: &K) -> Result<Option<V>, TreeError> {
        let _guard = self.enter(false);
        self.run("search", || {
            let Some(found) = self.descend(key, true)? else {
                return Ok(None);
            };
            let Some(position) = found.position else {
                validate(&found.node.latch, found.version)?;
                return Ok(None);
            };
            let value = found.node.read().values.get(position).cloned();
            validate(&found.node.latch, found.version)?;
            value.map(Some).ok_or(Interrupt::Restart)
        })
    }

    /// Remove `key` from the tree. Returns whether it was present.
    ///
    /// Records already flushed to the partition store are not retracted.
    pub fn delete(&self, key: &K) -> Result<bool, TreeError> {
        let _guard = self.enter(true);
        self.run("delete", || self.delete_attempt(key))
    }

    /// Number of entries in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        root_of(&self.root).is_none()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.arena.live_count()
    }

    #[must_use]
    pub const fn strategy(&self) -> SyncStrategy {
        self.config.strategy
    }

    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The partition store node buffers drain into.
    #[must_use]
    pub const fn store(&self) -> &PartitionStore<K, V> {
        &self.store
    }

    fn insert_attempt(&self, key: &K, value: &V) -> Attempt<()> {
        let mut session = self.session();

        let Some(Located { node: leaf, version, .. }) = self.descend(key, false)? else {
            session.lock_root(None)?;
            let body = NodeBody::with_entries(vec![key.clone()], vec![value.clone()], Vec::new());
            let root = session.allocate(true, body, None);
            session.set_root(Some(root.id()));
            self.len.fetch_add(1, Ordering::AcqRel);
            tracing::debug!("created root leaf {}", root.id());
            return Ok(());
        };

        session.upgrade(&leaf, version)?;
        self.lock_split_path(&mut session, &leaf)?;

        let buffer_full = {
            let mut body = leaf.write();
            body.insert_entry(key.clone(), value.clone());
            body.buffer.len() > self.config.buffer_size
        };
        self.len.fetch_add(1, Ordering::AcqRel);

        let drained = if buffer_full {
            self.drain_buffer(&leaf)
        } else {
            Ok(0)
        };
        self.split_upwards(&mut session, leaf);
        drained?;
        Ok(())
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone when the target is the leaf
    fn delete_attempt(&self, key: &K) -> Attempt<bool> {
        let mut session = self.session();

        let Some(Located {
            node: target,
            version,
            position,
        }) = self.descend(key, true)?
        else {
            return Ok(false);
        };
        let Some(position) = position else {
            validate(&target.latch, version)?;
            return Ok(false);
        };
        session.upgrade(&target, version)?;

        // An entry in an internal node is replaced by its in-order
        // predecessor, which always sits at the end of a leaf.
        let leaf = if target.is_leaf() {
            Arc::clone(&target)
        } else {
            let subtree = target.read().children[position];
            let (leaf, leaf_version) = self.rightmost_leaf(subtree)?;
            session.upgrade(&leaf, leaf_version)?;
            leaf
        };
        self.lock_merge_path(&mut session, &leaf)?;

        if Arc::ptr_eq(&target, &leaf) {
            leaf.write().remove_entry(position);
        } else {
            let (predecessor_key, predecessor_value) = {
                let mut body = leaf.write();
                let Some(last) = body.keys.len().checked_sub(1) else {
                    panic!("leaf {} under an internal node is empty", leaf.id());
                };
                body.remove_entry(last)
            };
            let mut body = target.write();
            body.keys[position] = predecessor_key.clone();
            body.values[position] = predecessor_value.clone();
            body.unstage(key);
            body.buffer.insert(predecessor_key, predecessor_value);
        }
        self.len.fetch_sub(1, Ordering::AcqRel);

        self.rebalance_upwards(&mut session, leaf);
        Ok(true)
    }

    /// Walk from the root towards `key` without taking any latch.
    ///
    /// With `stop_on_match` the walk ends at the first node holding `key`;
    /// otherwise it always ends at a leaf. Returns `None` for an empty tree.
    pub(super) fn descend(&self, key: &K, stop_on_match: bool) -> Attempt<Option<Located<K, V>>> {
        let root_version = self
            .root_latch
            .stable_version(DEFAULT_SPIN_LIMIT)
            .ok_or(Interrupt::Restart)?;
        let Some(root_id) = root_of(&self.root) else {
            validate(&self.root_latch, root_version)?;
            return Ok(None);
        };
        let mut node = self.node(root_id)?;
        let mut version = stable(&node, DEFAULT_SPIN_LIMIT)?;
        validate(&self.root_latch, root_version)?;

        loop {
            let (position, next) = {
                let body = node.read();
                let position = body.position(key);
                let next = if node.is_leaf() || (stop_on_match && position.is_some()) {
                    None
                } else {
                    Some(body.children.get(body.child_index(key)).copied())
                };
                (position, next)
            };

            let Some(child) = next else {
                return Ok(Some(Located {
                    node,
                    version,
                    position,
                }));
            };
            let child = self.node(child.ok_or(Interrupt::Restart)?)?;
            let child_version = stable(&child, DEFAULT_SPIN_LIMIT)?;
            validate(&node.latch, version)?;
            node = child;
            version = child_version;
        }
    }

    /// Optimistically find the rightmost leaf below `id`.
    fn rightmost_leaf(&self, id: NodeId) -> Attempt<(Arc<Node<K, V>>, u64)> {
        let mut node = self.node(id)?;
        let mut version = stable(&node, DEFAULT_SPIN_LIMIT)?;
        while !node.is_leaf() {
            let last = node.read().children.last().copied();
            let child = self.node(last.ok_or(Interrupt::Restart)?)?;
            let child_version = stable(&child, DEFAULT_SPIN_LIMIT)?;
            validate(&node.latch, version)?;
            node = child;
            version = child_version;
        }
        Ok((node, version))
    }

    /// Retry `attempt` until it completes, fails, or runs out of restarts.
    pub(super) fn run<T>(
        &self,
        operation: &'static str,
        mut attempt: impl FnMut() -> Attempt<T>,
    ) -> Result<T, TreeError> {
        let mut restarts = 0usize;
        loop {
            match attempt() {
                Ok(result) => return Ok(result),
                Err(Interrupt::Failed(error)) => return Err(error),
                Err(Interrupt::Restart) => {
                    restarts += 1;
                    if restarts >= self.config.max_restarts {
                        tracing::warn!("{operation}: giving up after {restarts} restarts");
                        return Err(TreeError::Contention { restarts });
                    }
                    backoff(restarts);
                }
            }
        }
    }

    /// Take the tree-wide lock if the coarse strategy is in use.
    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    pub(super) fn enter(&self, exclusive: bool) -> Option<CoarseGuard<'_>> {
        if self.config.strategy != SyncStrategy::Coarse {
            return None;
        }
        Some(if exclusive {
            CoarseGuard::Exclusive(self.coarse.write().expect("tree lock poisoned"))
        } else {
            CoarseGuard::Shared(self.coarse.read().expect("tree lock poisoned"))
        })
    }

    pub(super) fn session(&self) -> WriteSession<'_, K, V> {
        WriteSession::new(&self.arena, &self.root_latch, &self.root, DEFAULT_SPIN_LIMIT)
    }

    /// Resolve an id read optimistically. A missing node means the id went
    /// stale under us.
    pub(super) fn node(&self, id: NodeId) -> Attempt<Arc<Node<K, V>>> {
        self.arena.get(id).ok_or(Interrupt::Restart)
    }

    /// Resolve an id read from a latched node, where it must be live.
    pub(super) fn linked(&self, id: NodeId) -> Arc<Node<K, V>> {
        self.arena
            .get(id)
            .unwrap_or_else(|| panic!("node {id} is linked into the tree but not allocated"))
    }
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Partition store error.
    Store(StoreError),
    /// An optimistic operation kept conflicting with concurrent writers.
    /// Retrying the operation may succeed.
    Contention { restarts: usize },
    /// A structural check failed.
    Invariant(String),
}

impl TreeError {
    /// Whether the failed operation can simply be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Contention { restarts } => {
                write!(f, "operation abandoned after {restarts} restarts")
            }
            Self::Invariant(message) => write!(f, "invariant violated: {message}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Contention { .. } | Self::Invariant(_) => None,
        }
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for TreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
