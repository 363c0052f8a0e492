//! Structural maintenance: split on overflow, borrow or merge on underflow.
//!
//! Each operation runs in two phases. The `lock_*_path` functions latch
//! every node the structural change can reach, restarting if any latch is
//! busy. Only then do `split_upwards` and `rebalance_upwards` mutate, and
//! they cannot fail.

use std::sync::Arc;

use crate::btree::node::{Node, NodeBody};
use crate::btree::sync::{Attempt, Interrupt, WriteSession};
use crate::btree::tree::{BufferedBTree, IndexKey, IndexValue};

type Session<'t, K, V> = WriteSession<'t, K, V>;

impl<K: IndexKey, V: IndexValue> BufferedBTree<K, V> {
    /// Latch the parent of a latched `node`.
    ///
    /// For the root, latches the root slot instead and returns `None`.
    pub(super) fn lock_parent(
        &self,
        session: &mut Session<'_, K, V>,
        node: &Node<K, V>,
    ) -> Attempt<Option<Arc<Node<K, V>>>> {
        let Some(parent_id) = node.parent() else {
            session.lock_root(Some(node.id()))?;
            return Ok(None);
        };
        let parent = self.node(parent_id)?;
        session.lock(&parent)?;
        // A concurrent split of the old parent may have moved `node` before
        // we got the latch.
        if node.parent() != Some(parent_id) {
            return Err(Interrupt::Restart);
        }
        Ok(Some(parent))
    }

    /// Latch every ancestor an insert into `leaf` would split.
    #[allow(clippy::disallowed_methods)] // Arc::clone to walk up from the leaf
    pub(super) fn lock_split_path(
        &self,
        session: &mut Session<'_, K, V>,
        leaf: &Arc<Node<K, V>>,
    ) -> Attempt<()> {
        let mut node = Arc::clone(leaf);
        let mut projected = node.read().keys.len() + 1;
        while projected > self.config.buffer_size {
            let Some(parent) = self.lock_parent(session, &node)? else {
                break;
            };
            projected = parent.read().keys.len() + 1;
            node = parent;
        }
        Ok(())
    }

    /// Latch every node a delete from `leaf` can rebalance: the parent and
    /// both siblings of each node that may underflow, and the root slot if
    /// the root may empty.
    #[allow(clippy::disallowed_methods)] // Arc::clone to walk up from the leaf
    pub(super) fn lock_merge_path(
        &self,
        session: &mut Session<'_, K, V>,
        leaf: &Arc<Node<K, V>>,
    ) -> Attempt<()> {
        let min_keys = self.config.min_keys();
        let mut node = Arc::clone(leaf);
        let mut projected = node.read().keys.len().saturating_sub(1);
        loop {
            if node.parent().is_none() {
                if projected == 0 {
                    session.lock_root(Some(node.id()))?;
                }
                return Ok(());
            }
            if projected >= min_keys {
                return Ok(());
            }
            let Some(parent) = self.lock_parent(session, &node)? else {
                return Err(Interrupt::Restart);
            };
            let siblings = {
                let body = parent.read();
                let index = body
                    .child_position(node.id())
                    .ok_or(Interrupt::Restart)?;
                [
                    index.checked_sub(1).and_then(|i| body.children.get(i).copied()),
                    body.children.get(index + 1).copied(),
                ]
            };
            for sibling in siblings.into_iter().flatten() {
                session.lock(&self.node(sibling)?)?;
            }
            projected = parent.read().keys.len().saturating_sub(1);
            node = parent;
        }
    }

    /// Split `node` while it holds more than `buffer_size` keys, walking up
    /// through the parents that receive promoted entries.
    ///
    /// The old node keeps the left half. Every node touched must already be
    /// latched by `session`.
    pub(super) fn split_upwards(&self, session: &mut Session<'_, K, V>, node: Arc<Node<K, V>>) {
        let mut node = node;
        while node.read().keys.len() > self.config.buffer_size {
            let (key, value, right_body) = {
                let mut body = node.write();
                let mid = body.keys.len() / 2;
                let right_keys = body.keys.split_off(mid + 1);
                let right_values = body.values.split_off(mid + 1);
                let right_children = if node.is_leaf() {
                    Vec::new()
                } else {
                    body.children.split_off(mid + 1)
                };
                let key = body.keys.remove(mid);
                let value = body.values.remove(mid);
                body.reload_buffer();
                (
                    key,
                    value,
                    NodeBody::with_entries(right_keys, right_values, right_children),
                )
            };

            let parent_id = node.parent();
            let right = session.allocate(node.is_leaf(), right_body, parent_id);
            for &child in &right.read().children {
                self.linked(child).set_parent(Some(right.id()));
            }
            tracing::debug!(
                "split node {}, new right sibling {}, promoting {key:?}",
                node.id(),
                right.id()
            );

            let Some(parent_id) = parent_id else {
                let root_body = NodeBody::with_entries(
                    vec![key],
                    vec![value],
                    vec![node.id(), right.id()],
                );
                let root = session.allocate(false, root_body, None);
                node.set_parent(Some(root.id()));
                right.set_parent(Some(root.id()));
                session.set_root(Some(root.id()));
                tracing::debug!("new root {}, tree grew a level", root.id());
                return;
            };

            debug_assert!(session.holds(parent_id), "split parent {parent_id} not latched");
            let parent = self.linked(parent_id);
            {
                let mut body = parent.write();
                let Some(index) = body.child_position(node.id()) else {
                    panic!("node {} missing from parent {parent_id}", node.id());
                };
                body.keys.insert(index, key.clone());
                body.values.insert(index, value.clone());
                body.children.insert(index + 1, right.id());
                body.buffer.insert(key, value);
            }
            node = parent;
        }
    }

    /// Restore the minimum fill of `node` and its ancestors after a delete.
    ///
    /// Every node touched must already be latched by `session`.
    pub(super) fn rebalance_upwards(&self, session: &mut Session<'_, K, V>, node: Arc<Node<K, V>>) {
        let min_keys = self.config.min_keys();
        let mut node = node;
        loop {
            let len = node.read().keys.len();
            let Some(parent_id) = node.parent() else {
                if len == 0 {
                    self.shrink_root(session, &node);
                }
                return;
            };
            if len >= min_keys {
                return;
            }

            let parent = self.linked(parent_id);
            let (index, left, right) = {
                let body = parent.read();
                let Some(index) = body.child_position(node.id()) else {
                    panic!("node {} missing from parent {parent_id}", node.id());
                };
                let left = index.checked_sub(1).map(|i| body.children[i]);
                let right = body.children.get(index + 1).copied();
                (index, left.map(|id| self.linked(id)), right.map(|id| self.linked(id)))
            };

            match (left, right) {
                (Some(left), _) if left.read().keys.len() > min_keys => {
                    self.borrow_from_left(&parent, index, &left, &node);
                    tracing::debug!("node {} borrowed from left sibling {}", node.id(), left.id());
                    return;
                }
                (_, Some(right)) if right.read().keys.len() > min_keys => {
                    self.borrow_from_right(&parent, index, &node, &right);
                    tracing::debug!("node {} borrowed from right sibling {}", node.id(), right.id());
                    return;
                }
                (Some(left), _) => {
                    self.merge(session, &parent, index - 1, &left, &node);
                }
                (None, Some(right)) => {
                    self.merge(session, &parent, index, &node, &right);
                }
                (None, None) => {
                    panic!("node {} has no siblings under parent {parent_id}", node.id());
                }
            }
            node = parent;
        }
    }

    /// Empty root: an empty leaf empties the tree, an empty internal node
    /// hands the root to its only child.
    fn shrink_root(&self, session: &mut Session<'_, K, V>, root: &Node<K, V>) {
        if root.is_leaf() {
            session.set_root(None);
            tracing::debug!("removed root {}, tree is empty", root.id());
        } else {
            let child = self.linked(root.read().children[0]);
            child.set_parent(None);
            session.set_root(Some(child.id()));
            tracing::debug!("root {} replaced by {}, tree lost a level", root.id(), child.id());
        }
        session.retire(root.id());
    }

    /// Rotate the last entry of `left` through the parent separator into
    /// the front of `node`.
    fn borrow_from_left(
        &self,
        parent: &Node<K, V>,
        index: usize,
        left: &Node<K, V>,
        node: &Node<K, V>,
    ) {
        let (donated_key, donated_value, donated_child) = {
            let mut body = left.write();
            let last = body.keys.len() - 1;
            let (key, value) = body.remove_entry(last);
            (key, value, body.children.pop())
        };

        let (separator_key, separator_value) = {
            let mut body = parent.write();
            let separator_key =
                std::mem::replace(&mut body.keys[index - 1], donated_key.clone());
            let separator_value =
                std::mem::replace(&mut body.values[index - 1], donated_value.clone());
            body.unstage(&separator_key);
            body.buffer.insert(donated_key, donated_value);
            (separator_key, separator_value)
        };

        let mut body = node.write();
        body.keys.insert(0, separator_key.clone());
        body.values.insert(0, separator_value.clone());
        body.buffer.insert(separator_key, separator_value);
        if let Some(child) = donated_child {
            body.children.insert(0, child);
            drop(body);
            self.linked(child).set_parent(Some(node.id()));
        }
    }

    /// Rotate the first entry of `right` through the parent separator onto
    /// the back of `node`.
    fn borrow_from_right(
        &self,
        parent: &Node<K, V>,
        index: usize,
        node: &Node<K, V>,
        right: &Node<K, V>,
    ) {
        let (donated_key, donated_value, donated_child) = {
            let mut body = right.write();
            let (key, value) = body.remove_entry(0);
            let child = (!body.children.is_empty()).then(|| body.children.remove(0));
            (key, value, child)
        };

        let (separator_key, separator_value) = {
            let mut body = parent.write();
            let separator_key = std::mem::replace(&mut body.keys[index], donated_key.clone());
            let separator_value =
                std::mem::replace(&mut body.values[index], donated_value.clone());
            body.unstage(&separator_key);
            body.buffer.insert(donated_key, donated_value);
            (separator_key, separator_value)
        };

        let mut body = node.write();
        body.keys.push(separator_key.clone());
        body.values.push(separator_value.clone());
        body.buffer.insert(separator_key, separator_value);
        if let Some(child) = donated_child {
            body.children.push(child);
            drop(body);
            self.linked(child).set_parent(Some(node.id()));
        }
    }

    /// Fold `right` and the separator at `separator` into `left`, then drop
    /// `right` from `parent` and retire it.
    fn merge(
        &self,
        session: &mut Session<'_, K, V>,
        parent: &Node<K, V>,
        separator: usize,
        left: &Node<K, V>,
        right: &Node<K, V>,
    ) {
        let (separator_key, separator_value) = {
            let mut body = parent.write();
            let entry = body.remove_entry(separator);
            body.children.remove(separator + 1);
            entry
        };

        let (keys, values, children, buffer) = {
            let body = right.read();
            (
                body.keys.clone(),
                body.values.clone(),
                body.children.clone(),
                body.buffer.clone(),
            )
        };
        {
            let mut body = left.write();
            body.buffer
                .insert(separator_key.clone(), separator_value.clone());
            body.keys.push(separator_key);
            body.values.push(separator_value);
            body.keys.extend(keys);
            body.values.extend(values);
            body.buffer.extend(buffer);
            body.children.extend(children.iter().copied());
        }
        for child in children {
            self.linked(child).set_parent(Some(left.id()));
        }

        session.retire(right.id());
        tracing::debug!("merged node {} into {}", right.id(), left.id());
    }
}
