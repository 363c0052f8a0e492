//! Moving node buffers to and from the partition store.

use std::sync::Arc;

use crate::btree::latch::{DEFAULT_SPIN_LIMIT, VersionLatch};
use crate::btree::node::Node;
use crate::btree::sync::{Attempt, Interrupt, root_of, stable, validate};
use crate::btree::tree::{BufferedBTree, IndexKey, IndexValue, TreeError};
use crate::storage::StoreError;

/// A node together with its depth (root = 0).
type Placed<K, V> = (Arc<Node<K, V>>, usize);

impl<K: IndexKey, V: IndexValue> BufferedBTree<K, V> {
    /// Drain every node buffer into the partition store, children before
    /// their parent.
    ///
    /// Entries the store already caches with the same value are dropped
    /// from the buffer without another append. On a store error the
    /// entries not yet written stay buffered and the error is returned.
    ///
    /// Nodes split or merged by concurrent writers while the flush runs may
    /// be skipped; their entries are picked up by the next flush.
    pub fn flush(&self) -> Result<(), TreeError> {
        let _guard = self.enter(true);
        let nodes = self.run("flush", || self.post_order())?;

        let mut written = 0;
        for (node, _) in &nodes {
            written += self.run("flush", || {
                if VersionLatch::is_obsolete(node.latch.load()) {
                    return Ok(0);
                }
                let mut session = self.session();
                session.lock(node)?;
                Ok(self.drain_buffer(node)?)
            })?;
        }
        tracing::debug!("flushed {} node buffers, {written} records written", nodes.len());
        Ok(())
    }

    /// Reset the buffer of every node at depth `level` (root = 0) to exactly
    /// its current entries. The partition store is not consulted.
    pub fn load_level_to_buffer(&self, level: usize) -> Result<(), TreeError> {
        let _guard = self.enter(true);
        let nodes = self.run("load_level_to_buffer", || self.post_order())?;

        let mut loaded = 0;
        for (node, _) in nodes.iter().filter(|(_, depth)| *depth == level) {
            loaded += self.run("load_level_to_buffer", || {
                if VersionLatch::is_obsolete(node.latch.load()) {
                    return Ok(0);
                }
                let mut session = self.session();
                session.lock(node)?;
                node.write().reload_buffer();
                Ok(1)
            })?;
        }
        tracing::debug!("reloaded {loaded} node buffers at level {level}");
        Ok(())
    }

    /// Every node in post-order, each with its depth.
    ///
    /// Each node's child list is read at a validated version, so every id
    /// listed was a real child at some point during the walk.
    fn post_order(&self) -> Attempt<Vec<Placed<K, V>>> {
        let root_version = self
            .root_latch
            .stable_version(DEFAULT_SPIN_LIMIT)
            .ok_or(Interrupt::Restart)?;
        let Some(root_id) = root_of(&self.root) else {
            validate(&self.root_latch, root_version)?;
            return Ok(Vec::new());
        };
        let root = self.node(root_id)?;
        stable(&root, DEFAULT_SPIN_LIMIT)?;
        validate(&self.root_latch, root_version)?;

        let mut placed = Vec::new();
        self.visit(root, 0, &mut placed)?;
        Ok(placed)
    }

    fn visit(
        &self,
        node: Arc<Node<K, V>>,
        depth: usize,
        placed: &mut Vec<Placed<K, V>>,
    ) -> Attempt<()> {
        let version = stable(&node, DEFAULT_SPIN_LIMIT)?;
        let children = node.read().children.clone();
        for id in children {
            let child = self.node(id)?;
            stable(&child, DEFAULT_SPIN_LIMIT)?;
            validate(&node.latch, version)?;
            self.visit(child, depth + 1, placed)?;
        }
        placed.push((node, depth));
        Ok(())
    }

    /// Write the buffer of a latched node to the store and clear it.
    ///
    /// Returns the number of records appended.
    pub(super) fn drain_buffer(&self, node: &Node<K, V>) -> Result<usize, StoreError> {
        let pending = std::mem::take(&mut node.write().buffer);
        let mut written = 0;
        let mut entries = pending.into_iter();
        while let Some((key, value)) = entries.next() {
            if self.store.is_cached(&key, &value) {
                continue;
            }
            if let Err(e) = self.store.insert(&key, &value) {
                let mut body = node.write();
                body.buffer.insert(key, value);
                body.buffer.extend(entries);
                return Err(e);
            }
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::SyncStrategy;
    use crate::config::IndexConfig;
    use crate::storage::PartitionStore;
    use tempfile::tempdir;

    fn create_tree(
        dir: &std::path::Path,
        strategy: SyncStrategy,
    ) -> BufferedBTree<u64, String> {
        let config = IndexConfig::new(3, 4, dir).with_strategy(strategy);
        BufferedBTree::with_config(config).expect("create tree")
    }

    #[test]
    fn test_flush_persists_every_entry() {
        for strategy in [SyncStrategy::Coarse, SyncStrategy::Optimistic] {
            let dir = tempdir().expect("create temp dir");
            let tree = create_tree(dir.path(), strategy);
            for key in 0..50u64 {
                tree.insert(key, format!("v{key}")).expect("insert");
            }
            tree.flush().expect("flush");
            assert_eq!(tree.buffered_len().expect("buffered"), 0);

            let fresh: PartitionStore<u64, String> =
                PartitionStore::open(4, dir.path(), false).expect("reopen store");
            for key in 0..50u64 {
                assert_eq!(fresh.get(&key).expect("get"), Some(format!("v{key}")));
            }
        }
    }

    #[test]
    fn test_flush_skips_entries_already_cached() {
        let dir = tempdir().expect("create temp dir");
        let tree = create_tree(dir.path(), SyncStrategy::Coarse);
        tree.insert(1, "one".to_string()).expect("insert");
        tree.flush().expect("flush");

        // Reloading restages the entry, but the store already holds it.
        tree.load_level_to_buffer(0).expect("load level");
        assert_eq!(tree.buffered_len().expect("buffered"), 1);
        tree.flush().expect("flush");

        let index = tree.store().partition_of(&1);
        let records = tree.store().scan_partition(index).expect("scan");
        assert_eq!(records, vec![(1, "one".to_string())]);
    }

    #[test]
    fn test_post_order_lists_children_first() {
        let dir = tempdir().expect("create temp dir");
        let tree = create_tree(dir.path(), SyncStrategy::Coarse);
        for key in 1..=30u64 {
            tree.insert(key, format!("v{key}")).expect("insert");
        }

        let placed = tree.post_order().expect("walk");
        assert_eq!(placed.len(), tree.arena.live_count());
        let (root, root_depth) = placed.last().expect("root listed");
        assert_eq!(*root_depth, 0);
        assert_eq!(root.parent(), None);

        for (index, (node, depth)) in placed.iter().enumerate() {
            for child in node.read().children.iter() {
                let child_index = placed
                    .iter()
                    .position(|(n, _)| n.id() == *child)
                    .expect("child listed");
                assert!(child_index < index, "child {child} after its parent");
                assert_eq!(placed[child_index].1, depth + 1);
            }
        }
    }

    #[test]
    fn test_eager_drain_when_buffer_overflows() {
        let dir = tempdir().expect("create temp dir");
        let tree = create_tree(dir.path(), SyncStrategy::Coarse);
        for key in [1u64, 2, 3] {
            tree.insert(key, format!("v{key}")).expect("insert");
        }
        assert_eq!(tree.store().get(&1).expect("get"), None);

        // The fourth entry overflows the buffer of three.
        tree.insert(4, "v4".to_string()).expect("insert");
        for key in [1u64, 2, 3, 4] {
            assert_eq!(tree.store().get(&key).expect("get"), Some(format!("v{key}")));
        }
    }

    #[test]
    fn test_load_level_restages_only_that_depth() {
        let dir = tempdir().expect("create temp dir");
        let tree = create_tree(dir.path(), SyncStrategy::Coarse);
        for key in 1..=10u64 {
            tree.insert(key, format!("v{key}")).expect("insert");
        }
        tree.flush().expect("flush");
        assert_eq!(tree.buffered_len().expect("buffered"), 0);

        let snapshot = tree.snapshot().expect("snapshot").expect("non-empty");
        tree.load_level_to_buffer(0).expect("load level");
        assert_eq!(tree.buffered_len().expect("buffered"), snapshot.keys.len());

        tree.load_level_to_buffer(usize::MAX).expect("no such level");
        assert_eq!(tree.buffered_len().expect("buffered"), snapshot.keys.len());

        let height = tree.height().expect("height");
        for level in 0..height {
            tree.load_level_to_buffer(level).expect("load level");
        }
        assert_eq!(tree.buffered_len().expect("buffered"), 10);
    }

    #[test]
    fn test_failed_flush_keeps_entries_buffered() {
        let dir = tempdir().expect("create temp dir");
        let config = IndexConfig::new(3, 1, dir.path());
        let tree: BufferedBTree<u64, String> =
            BufferedBTree::with_config(config).expect("create tree");
        for key in [1u64, 2, 3] {
            tree.insert(key, format!("v{key}")).expect("insert");
        }

        tree.store().make_log_read_only(0).expect("swap handle");
        let error = tree.flush().expect_err("append fails");
        assert!(matches!(error, TreeError::Store(StoreError::Io(_))));
        assert!(!error.is_retryable());
        assert_eq!(tree.buffered_len().expect("buffered"), 3);

        tree.store().reopen_log(0).expect("reopen handle");
        tree.flush().expect("flush");
        assert_eq!(tree.buffered_len().expect("buffered"), 0);
        let records = tree.store().scan_partition(0).expect("scan");
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_failed_eager_drain_still_inserts() {
        let dir = tempdir().expect("create temp dir");
        let config = IndexConfig::new(3, 1, dir.path());
        let tree: BufferedBTree<u64, String> =
            BufferedBTree::with_config(config).expect("create tree");
        for key in [1u64, 2, 3] {
            tree.insert(key, format!("v{key}")).expect("insert");
        }

        tree.store().make_log_read_only(0).expect("swap handle");
        let error = tree.insert(4, "v4".to_string()).expect_err("drain fails");
        assert!(matches!(error, TreeError::Store(_)));

        // The entry is in the tree and the split still happened.
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.search(&4).expect("search"), Some("v4".to_string()));
        assert_eq!(tree.height().expect("height"), 2);
        tree.check_invariants().expect("valid tree");
        assert_eq!(tree.buffered_len().expect("buffered"), 4);

        tree.store().reopen_log(0).expect("reopen handle");
        tree.flush().expect("flush");
        let fresh: PartitionStore<u64, String> =
            PartitionStore::open(1, dir.path(), false).expect("reopen store");
        for key in 1..=4u64 {
            assert_eq!(fresh.get(&key).expect("get"), Some(format!("v{key}")));
        }
    }

    #[test]
    fn test_flush_empty_tree() {
        let dir = tempdir().expect("create temp dir");
        let tree = create_tree(dir.path(), SyncStrategy::Optimistic);
        tree.flush().expect("flush");
        tree.load_level_to_buffer(0).expect("load level");
        assert_eq!(tree.buffered_len().expect("buffered"), 0);
    }
}
