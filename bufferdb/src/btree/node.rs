//! Buffered B-tree nodes and the arena that owns them.
//!
//! Nodes never own each other. The [`NodeArena`] holds every live node and
//! hands out `Arc` references; parent/child relations are plain [`NodeId`]
//! fields. That keeps the parent back-reference from forming an ownership
//! cycle while still giving O(1) upward navigation.
//!
//! # Node Layout
//!
//! - `keys`: sorted, `values[i]` belongs to `keys[i]`
//! - `children`: `keys.len() + 1` ids for internal nodes, empty for leaves
//! - `buffer`: entries staged for the partition store
//! - `parent`: back-reference, `None` for the root
//!
//! `Child[i]` holds keys `< Key[i]`, `Child[i+1]` holds keys `>= Key[i]`.
//!
//! # Synchronization
//!
//! Each node carries a [`VersionLatch`] (the logical lock) and keeps its
//! fields behind an `RwLock`. The `RwLock` is only there to make field access
//! memory safe: it is held for the duration of one copy or one mutation, never
//! across nodes. Whether a reader saw a consistent state is decided by the
//! latch version, not by the `RwLock`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::btree::latch::VersionLatch;

/// Stable handle of a node in the arena.
pub type NodeId = usize;

/// Sentinel stored in `parent` for the root.
const NO_PARENT: usize = usize::MAX;

/// Mutable contents of a node.
#[derive(Debug)]
pub struct NodeBody<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<NodeId>,
    /// Entries not yet written to the partition store.
    pub buffer: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> NodeBody<K, V> {
    /// A body holding `keys`/`values`/`children` with a buffer mirroring
    /// the entries.
    #[must_use]
    pub fn with_entries(keys: Vec<K>, values: Vec<V>, children: Vec<NodeId>) -> Self {
        let mut body = Self {
            keys,
            values,
            children,
            buffer: BTreeMap::new(),
        };
        body.reload_buffer();
        body
    }

    /// Child slot for `key`: the number of keys `<= key`.
    ///
    /// Equal keys route right, so re-inserting an existing key lands after
    /// it rather than replacing it.
    #[must_use]
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Position of the first occurrence of `key`.
    #[must_use]
    pub fn position(&self, key: &K) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Insert an entry at its sorted position and stage it in the buffer.
    pub fn insert_entry(&mut self, key: K, value: V) {
        let index = self.child_index(&key);
        self.buffer.insert(key.clone(), value.clone());
        self.keys.insert(index, key);
        self.values.insert(index, value);
    }

    /// Remove the entry at `index` and drop it from the buffer.
    ///
    /// If the key was staged and another entry with the same key remains,
    /// the slot is kept for the remaining entry instead.
    pub fn remove_entry(&mut self, index: usize) -> (K, V) {
        let key = self.keys.remove(index);
        let value = self.values.remove(index);
        self.unstage(&key);
        (key, value)
    }

    /// Drop `key` from the buffer, restaging the right-most entry still
    /// holding that key if there is one.
    pub fn unstage(&mut self, key: &K) {
        if self.buffer.remove(key).is_none() {
            return;
        }
        if let Some(remaining) = self.keys.iter().rposition(|k| k == key) {
            self.buffer
                .insert(key.clone(), self.values[remaining].clone());
        }
    }

    /// Position of `child` among the children.
    #[must_use]
    pub fn child_position(&self, child: NodeId) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Replace the buffer with exactly the current entries.
    ///
    /// With duplicate keys the later (right-most) entry wins.
    pub fn reload_buffer(&mut self) {
        self.buffer = self
            .keys
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect();
    }

    /// Whether the field lengths agree with each other.
    #[must_use]
    pub fn is_consistent(&self, is_leaf: bool) -> bool {
        let children_ok = if is_leaf {
            self.children.is_empty()
        } else {
            self.children.len() == self.keys.len() + 1
        };
        self.keys.len() == self.values.len() && children_ok
    }
}

/// A B-tree node with a write buffer.
#[derive(Debug)]
pub struct Node<K, V> {
    id: NodeId,
    is_leaf: bool,
    pub latch: VersionLatch,
    parent: AtomicUsize,
    body: RwLock<NodeBody<K, V>>,
}

impl<K, V> Node<K, V> {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        match self.parent.load(Ordering::Acquire) {
            NO_PARENT => None,
            id => Some(id),
        }
    }

    /// Point the back-reference at `parent`.
    ///
    /// Only the writer holding the latch of the old or new parent moves a
    /// child, so this does not need the child's own latch.
    pub fn set_parent(&self, parent: Option<NodeId>) {
        self.parent
            .store(parent.unwrap_or(NO_PARENT), Ordering::Release);
    }

    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    pub fn read(&self) -> RwLockReadGuard<'_, NodeBody<K, V>> {
        self.body.read().expect("node lock poisoned")
    }

    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    pub fn write(&self) -> RwLockWriteGuard<'_, NodeBody<K, V>> {
        self.body.write().expect("node lock poisoned")
    }
}

/// Owner of every live node.
///
/// Freed slots are recycled. A reader that still holds an `Arc` to a freed
/// node keeps it alive and sees its obsolete latch.
#[derive(Debug)]
pub struct NodeArena<K, V> {
    slots: RwLock<Vec<Option<Arc<Node<K, V>>>>>,
    free: Mutex<Vec<NodeId>>,
}

impl<K, V> Default for NodeArena<K, V> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }
}

impl<K, V> NodeArena<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node and return it with its latch already locked.
    #[allow(clippy::expect_used, clippy::disallowed_methods)] // poisoning is unrecoverable; Arc::clone for the slot
    pub fn allocate_locked(
        &self,
        is_leaf: bool,
        body: NodeBody<K, V>,
        parent: Option<NodeId>,
    ) -> Arc<Node<K, V>> {
        let reused = self.free.lock().expect("arena free list poisoned").pop();
        let mut slots = self.slots.write().expect("arena lock poisoned");
        let id = reused.unwrap_or(slots.len());

        let node = Arc::new(Node {
            id,
            is_leaf,
            latch: VersionLatch::new(),
            parent: AtomicUsize::new(parent.unwrap_or(NO_PARENT)),
            body: RwLock::new(body),
        });
        let locked = node.latch.try_lock(1);
        debug_assert!(locked, "fresh latch must be free");

        if id == slots.len() {
            slots.push(Some(Arc::clone(&node)));
        } else {
            slots[id] = Some(Arc::clone(&node));
        }
        node
    }

    /// Look up a live node.
    #[must_use]
    #[allow(clippy::expect_used, clippy::disallowed_methods)] // poisoning is unrecoverable; Arc::clone hands out a reference
    pub fn get(&self, id: NodeId) -> Option<Arc<Node<K, V>>> {
        self.slots
            .read()
            .expect("arena lock poisoned")
            .get(id)
            .and_then(Option::as_ref)
            .map(Arc::clone)
    }

    /// Drop the arena's reference to `id` and recycle the slot.
    #[allow(clippy::expect_used)] // poisoning is unrecoverable
    pub fn release(&self, id: NodeId) {
        let removed = self.slots.write().expect("arena lock poisoned")[id].take();
        if removed.is_some() {
            self.free.lock().expect("arena free list poisoned").push(id);
        }
    }

    /// Number of live nodes.
    #[must_use]
    #[allow(clippy::expect_used)] // poisoning is unrecoverable
    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .expect("arena lock poisoned")
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}
