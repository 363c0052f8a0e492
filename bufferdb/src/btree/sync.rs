//! Node synchronization strategies.
//!
//! A tree picks one strategy at construction:
//!
//! - [`SyncStrategy::Coarse`]: every tree-level operation holds the root lock
//!   for its whole duration, exclusive for mutations and shared for reads.
//!   This is a global reader/writer lock over the entire tree. Mutations are
//!   fully serialized and reads never overlap a mutation.
//! - [`SyncStrategy::Optimistic`]: optimistic lock coupling. Readers take no
//!   locks and validate node versions, restarting on conflict. Writers lock
//!   exactly the nodes they mutate, so disjoint subtrees change in parallel.
//!
//! Both strategies run the same tree algorithms. Under the coarse strategy the
//! per-node latches are still taken but can never contend.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::btree::latch::VersionLatch;
use crate::btree::node::{Node, NodeArena, NodeId};
use crate::btree::tree::TreeError;
use crate::storage::StoreError;

/// How tree operations synchronize with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// One reader/writer lock at the root guards the whole tree.
    #[default]
    Coarse,
    /// Version-validated lock-free reads, per-node write latches.
    Optimistic,
}

impl SyncStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coarse => "coarse",
            Self::Optimistic => "optimistic",
        }
    }
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coarse" => Ok(Self::Coarse),
            "optimistic" | "olc" => Ok(Self::Optimistic),
            other => Err(format!(
                "unknown strategy '{other}' (expected 'coarse' or 'optimistic')"
            )),
        }
    }
}

/// Why an operation attempt stopped early.
#[derive(Debug)]
pub enum Interrupt {
    /// A version check or latch acquisition failed; retry from the top.
    Restart,
    /// The operation failed for good.
    Failed(TreeError),
}

impl From<TreeError> for Interrupt {
    fn from(e: TreeError) -> Self {
        Self::Failed(e)
    }
}

impl From<StoreError> for Interrupt {
    fn from(e: StoreError) -> Self {
        Self::Failed(TreeError::Store(e))
    }
}

/// Result of one attempt at a tree operation.
pub type Attempt<T> = Result<T, Interrupt>;

/// Read a node's stable version, restarting if it stays locked or the node
/// has been retired.
pub fn stable<K, V>(node: &Node<K, V>, spins: u32) -> Attempt<u64> {
    match node.latch.stable_version(spins) {
        Some(version) if !VersionLatch::is_obsolete(version) => Ok(version),
        _ => Err(Interrupt::Restart),
    }
}

/// Restart unless `latch` still holds `version`.
pub fn validate(latch: &VersionLatch, version: u64) -> Attempt<()> {
    if latch.validate(version) {
        Ok(())
    } else {
        Err(Interrupt::Restart)
    }
}

/// Pause between attempts, spinning briefly at first and then yielding.
pub fn backoff(restarts: usize) {
    if restarts < 8 {
        for _ in 0..(1u32 << restarts) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

/// The set of latches one write attempt holds.
///
/// Latches are acquired with a bounded spin; a failed acquisition returns
/// [`Interrupt::Restart`] and dropping the session releases everything, so
/// writers never wait on each other indefinitely and lock order cannot
/// deadlock. All latches an operation needs are taken before it mutates
/// anything, which makes a restart free of side effects.
pub struct WriteSession<'t, K, V> {
    arena: &'t NodeArena<K, V>,
    root_latch: &'t VersionLatch,
    root: &'t AtomicUsize,
    spins: u32,
    held: Vec<Arc<Node<K, V>>>,
    holds_root: bool,
    retired: Vec<NodeId>,
}

impl<'t, K, V> WriteSession<'t, K, V> {
    #[must_use]
    pub const fn new(
        arena: &'t NodeArena<K, V>,
        root_latch: &'t VersionLatch,
        root: &'t AtomicUsize,
        spins: u32,
    ) -> Self {
        Self {
            arena,
            root_latch,
            root,
            spins,
            held: Vec::new(),
            holds_root: false,
            retired: Vec::new(),
        }
    }

    #[must_use]
    pub fn holds(&self, id: NodeId) -> bool {
        self.held.iter().any(|node| node.id() == id)
    }

    /// Lock `node` if it is still at `version`.
    #[allow(clippy::disallowed_methods)] // Arc::clone to keep the node alive while held
    pub fn upgrade(&mut self, node: &Arc<Node<K, V>>, version: u64) -> Attempt<()> {
        if node.latch.try_upgrade(version) {
            self.held.push(Arc::clone(node));
            Ok(())
        } else {
            Err(Interrupt::Restart)
        }
    }

    /// Lock `node`, restarting if it stays busy or has been retired.
    #[allow(clippy::disallowed_methods)] // Arc::clone to keep the node alive while held
    pub fn lock(&mut self, node: &Arc<Node<K, V>>) -> Attempt<()> {
        if self.holds(node.id()) {
            return Ok(());
        }
        if !node.latch.try_lock(self.spins) {
            return Err(Interrupt::Restart);
        }
        self.held.push(Arc::clone(node));
        if VersionLatch::is_obsolete(node.latch.load()) {
            return Err(Interrupt::Restart);
        }
        Ok(())
    }

    /// Lock the latch guarding the root slot and check that the root is
    /// still `expected`.
    pub fn lock_root(&mut self, expected: Option<NodeId>) -> Attempt<()> {
        if !self.holds_root {
            if !self.root_latch.try_lock(self.spins) {
                return Err(Interrupt::Restart);
            }
            self.holds_root = true;
        }
        if root_of(self.root) == expected {
            Ok(())
        } else {
            Err(Interrupt::Restart)
        }
    }

    /// Publish a new root. The root latch must be held.
    pub fn set_root(&self, root: Option<NodeId>) {
        assert!(self.holds_root, "root replaced without holding the root latch");
        self.root.store(root.unwrap_or(usize::MAX), Ordering::Release);
    }

    /// Allocate a node that this session holds locked.
    #[allow(clippy::disallowed_methods)] // Arc::clone to keep the node alive while held
    pub fn allocate(
        &mut self,
        is_leaf: bool,
        body: crate::btree::node::NodeBody<K, V>,
        parent: Option<NodeId>,
    ) -> Arc<Node<K, V>> {
        let node = self.arena.allocate_locked(is_leaf, body, parent);
        self.held.push(Arc::clone(&node));
        node
    }

    /// Mark a held node for removal when the session ends.
    pub fn retire(&mut self, id: NodeId) {
        assert!(self.holds(id), "retiring node {id} without holding it");
        self.retired.push(id);
    }
}

impl<K, V> Drop for WriteSession<'_, K, V> {
    fn drop(&mut self) {
        for node in self.held.drain(..) {
            if self.retired.contains(&node.id()) {
                node.latch.unlock_obsolete();
                self.arena.release(node.id());
            } else {
                node.latch.unlock();
            }
        }
        if self.holds_root {
            self.root_latch.unlock();
        }
    }
}

/// Decode the root slot.
#[must_use]
pub fn root_of(root: &AtomicUsize) -> Option<NodeId> {
    match root.load(Ordering::Acquire) {
        usize::MAX => None,
        id => Some(id),
    }
}
