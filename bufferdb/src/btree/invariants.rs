//! Consistent snapshots of the tree and structural validation.

use std::sync::Arc;

use crate::btree::latch::DEFAULT_SPIN_LIMIT;
use crate::btree::node::{Node, NodeId};
use crate::btree::sync::{Attempt, Interrupt, root_of, stable, validate};
use crate::btree::tree::{BufferedBTree, IndexKey, IndexValue, TreeError};

/// Copy of one node and its subtree, taken at a single consistent point.
#[derive(Debug, Clone)]
pub struct NodeImage<K, V> {
    pub id: NodeId,
    pub is_leaf: bool,
    pub parent: Option<NodeId>,
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<Self>,
    /// Number of buffered entries.
    pub buffered: usize,
}

impl<K: Clone, V: Clone> NodeImage<K, V> {
    fn collect_entries(&self, out: &mut Vec<(K, V)>) {
        for (index, (key, value)) in self.keys.iter().zip(&self.values).enumerate() {
            if let Some(child) = self.children.get(index) {
                child.collect_entries(out);
            }
            out.push((key.clone(), value.clone()));
        }
        if let Some(last) = self.children.get(self.keys.len()) {
            last.collect_entries(out);
        }
    }

    fn buffered_total(&self) -> usize {
        self.buffered + self.children.iter().map(Self::buffered_total).sum::<usize>()
    }
}

impl<K: IndexKey, V: IndexValue> BufferedBTree<K, V> {
    /// Copy the whole tree. `None` if it is empty.
    ///
    /// Under the optimistic strategy the copy is validated as a whole and
    /// retaken if any node changed while it was being made.
    pub fn snapshot(&self) -> Result<Option<NodeImage<K, V>>, TreeError> {
        let _guard = self.enter(false);
        self.run("snapshot", || {
            let root_version = self
                .root_latch
                .stable_version(DEFAULT_SPIN_LIMIT)
                .ok_or(Interrupt::Restart)?;
            let Some(root_id) = root_of(&self.root) else {
                validate(&self.root_latch, root_version)?;
                return Ok(None);
            };
            let mut seen = Vec::new();
            let image = self.image(self.node(root_id)?, &mut seen)?;
            validate(&self.root_latch, root_version)?;
            for (node, version) in &seen {
                validate(&node.latch, *version)?;
            }
            Ok(Some(image))
        })
    }

    fn image(
        &self,
        node: Arc<Node<K, V>>,
        seen: &mut Vec<(Arc<Node<K, V>>, u64)>,
    ) -> Attempt<NodeImage<K, V>> {
        let version = stable(&node, DEFAULT_SPIN_LIMIT)?;
        let (keys, values, child_ids, buffered) = {
            let body = node.read();
            if !body.is_consistent(node.is_leaf()) {
                return Err(Interrupt::Restart);
            }
            (
                body.keys.clone(),
                body.values.clone(),
                body.children.clone(),
                body.buffer.len(),
            )
        };
        validate(&node.latch, version)?;

        let mut children = Vec::with_capacity(child_ids.len());
        for id in child_ids {
            children.push(self.image(self.node(id)?, seen)?);
        }
        let image = NodeImage {
            id: node.id(),
            is_leaf: node.is_leaf(),
            parent: node.parent(),
            keys,
            values,
            children,
            buffered,
        };
        seen.push((node, version));
        Ok(image)
    }

    /// All entries in key order.
    pub fn entries(&self) -> Result<Vec<(K, V)>, TreeError> {
        let mut entries = Vec::new();
        if let Some(root) = self.snapshot()? {
            root.collect_entries(&mut entries);
        }
        Ok(entries)
    }

    /// Total number of entries staged in node buffers.
    pub fn buffered_len(&self) -> Result<usize, TreeError> {
        Ok(self.snapshot()?.map_or(0, |root| root.buffered_total()))
    }

    /// Number of levels; 0 for an empty tree.
    pub fn height(&self) -> Result<usize, TreeError> {
        let mut height = 0;
        let mut level = self.snapshot()?;
        while let Some(node) = level {
            height += 1;
            level = node.children.into_iter().next();
        }
        Ok(height)
    }

    /// Validate the structure of the whole tree.
    ///
    /// Checks that keys are ordered within and across nodes, that entry and
    /// child counts agree, that parent back-references are correct, that
    /// every node is within its fill bounds and that all leaves sit at the
    /// same depth.
    pub fn check_invariants(&self) -> Result<(), TreeError> {
        let Some(root) = self.snapshot()? else {
            return Ok(());
        };
        if root.parent.is_some() {
            return Err(invariant(format!("root {} has a parent", root.id)));
        }
        let mut leaf_depth = None;
        self.check_node(&root, None, None, 0, &mut leaf_depth)
    }

    fn check_node(
        &self,
        node: &NodeImage<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<(), TreeError> {
        let id = node.id;
        if node.keys.len() != node.values.len() {
            return Err(invariant(format!(
                "node {id} has {} keys but {} values",
                node.keys.len(),
                node.values.len()
            )));
        }
        if node.keys.len() > self.config.buffer_size {
            return Err(invariant(format!(
                "node {id} holds {} keys, more than {}",
                node.keys.len(),
                self.config.buffer_size
            )));
        }
        let is_root = depth == 0;
        if !is_root && node.keys.len() < self.config.min_keys().max(1) {
            return Err(invariant(format!(
                "node {id} holds {} keys, fewer than {}",
                node.keys.len(),
                self.config.min_keys().max(1)
            )));
        }
        if node.keys.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(invariant(format!("node {id} keys out of order")));
        }
        let out_of_range = node.keys.iter().any(|key| {
            lower.is_some_and(|bound| key < bound) || upper.is_some_and(|bound| key > bound)
        });
        if out_of_range {
            return Err(invariant(format!("node {id} has keys outside its separators")));
        }

        if node.is_leaf {
            if !node.children.is_empty() {
                return Err(invariant(format!("leaf {id} has children")));
            }
            return match *leaf_depth {
                None => {
                    *leaf_depth = Some(depth);
                    Ok(())
                }
                Some(expected) if expected == depth => Ok(()),
                Some(expected) => Err(invariant(format!(
                    "leaf {id} at depth {depth}, expected {expected}"
                ))),
            };
        }

        if node.children.len() != node.keys.len() + 1 {
            return Err(invariant(format!(
                "internal node {id} has {} keys but {} children",
                node.keys.len(),
                node.children.len()
            )));
        }
        for (index, child) in node.children.iter().enumerate() {
            if child.parent != Some(id) {
                return Err(invariant(format!(
                    "node {} points at parent {:?}, expected {id}",
                    child.id, child.parent
                )));
            }
            let child_lower = if index == 0 { lower } else { node.keys.get(index - 1) };
            let child_upper = node.keys.get(index).or(upper);
            self.check_node(child, child_lower, child_upper, depth + 1, leaf_depth)?;
        }
        Ok(())
    }
}

fn invariant(message: String) -> TreeError {
    TreeError::Invariant(message)
}
