//! Copy-on-write changes to the tree, one `set` or `remove` at a time.
//!
//! A mutation never edits a node in place. Every node it touches is encoded
//! again at a freshly allocated address, the old copy is logically deleted,
//! and the pointer slot that referenced it is repointed. All three effects are
//! recorded in the version tracker under the mutation's task and the bytes are
//! staged as commands for the write pipeline, which queues them on `finish`.
//!
//! Value records are the exception: they are written synchronously, right
//! away, so the repair scan can always find them.
//!
//! The caller holds the engine lock for the whole mutation.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::storage::btree::node::{IndexNode, RecordCodec, VALUE_TAG_DEAD, ValueNode, encode_pointer};
use crate::storage::btree::rebalance::{self, Fixup, Plan, Step};
use crate::storage::btree::tree::{Inner, Key, Value};
use crate::storage::error::{Result, StoreError};
use crate::storage::file::AsyncFile;
use crate::storage::pipeline::Command;
use crate::storage::superblock::ROOT_SLOT;
use crate::storage::version::{TaskId, Version, VersionTracker};

/// Patch `node`'s pointers with whatever `task` should see in its slots.
///
/// Nodes read from disk or taken from a memo can carry pointers that a newer
/// task already repointed in place; the slot memos hold the current values.
pub fn time_travel<K>(tracker: &VersionTracker<K>, task: TaskId, node: &mut IndexNode<K>) {
    let depend = node.address;
    for n in 0..node.values.len() {
        if let Some(pointer) = tracker.resolve_pointer(task, node.value_slot(n), depend) {
            node.values[n] = pointer;
        }
    }
    for n in 0..node.children.len() {
        if let Some(pointer) = tracker.resolve_pointer(task, node.child_slot(n), depend) {
            node.children[n] = pointer;
        }
    }
}

/// State of one in-progress mutation.
pub struct Mutation<'a, K> {
    inner: &'a mut Inner<K>,
    file: &'a AsyncFile,
    codec: RecordCodec,
    min_degree: usize,
    task: TaskId,
    /// Staged writes by address; a later stage at the same address wins.
    commands: BTreeMap<u64, Command>,
    /// Value records written by this mutation, tombstoned again on abort.
    written: Vec<u64>,
}

impl<'a, K: Key> Mutation<'a, K> {
    /// Start a mutation under a fresh active task.
    pub fn begin(
        inner: &'a mut Inner<K>,
        file: &'a AsyncFile,
        codec: RecordCodec,
        min_degree: usize,
    ) -> Self {
        let task = inner.tracker.create_task(true);
        Self {
            inner,
            file,
            codec,
            min_degree,
            task,
            commands: BTreeMap::new(),
            written: Vec::new(),
        }
    }

    /// Insert or replace `key`.
    pub fn set<V: Value>(&mut self, key: K, value: V) -> Result<()> {
        let t = self.min_degree;
        let mut cursor = IndexNode::clone(&self.inner.root);
        let mut address = ROOT_SLOT;
        let mut depend = 0;

        if cursor.is_full(t) {
            let mut root = IndexNode::internal();
            root.children.push(cursor.address);
            self.split(address, &mut root, 0, cursor, depend)?;
            cursor = root;
        }

        while !cursor.is_leaf {
            let mut index = match cursor.search(&key) {
                Ok(i) => {
                    let (slot, pointer) = (cursor.value_slot(i), cursor.values[i]);
                    return self.replace(slot, pointer, cursor.address, key, value);
                }
                Err(i) => i,
            };

            let mut child = self.fetch(cursor.children[index])?;
            if let Ok(i) = child.search(&key) {
                let (slot, pointer) = (child.value_slot(i), child.values[i]);
                return self.replace(slot, pointer, child.address, key, value);
            }

            if child.is_full(t) {
                let (left, right) = self.split(address, &mut cursor, index, child, depend)?;
                child = if cursor.keys[index] < key {
                    index += 1;
                    right
                } else {
                    left
                };
            }

            address = cursor.child_slot(index);
            depend = cursor.address;
            cursor = child;
        }

        match cursor.search(&key) {
            Ok(i) => {
                let (slot, pointer) = (cursor.value_slot(i), cursor.values[i]);
                self.replace(slot, pointer, cursor.address, key, value)
            }
            Err(index) => self.insert(address, depend, cursor, index, key, value),
        }
    }

    /// Remove `key` if present.
    ///
    /// Walks down once, making sure every node entered can lose a key.
    pub fn remove<V: Value>(&mut self, key: &K) -> Result<()> {
        let t = self.min_degree;
        let mut node = IndexNode::clone(&self.inner.root);
        let mut address = ROOT_SLOT;
        let mut depend = 0;

        loop {
            let (plan, left, right) = match rebalance::classify(node.search(key), node.is_leaf) {
                Step::Missing => return Ok(()),
                Step::LeafDelete(index) => {
                    return self.delete_from_leaf::<V>(address, depend, node, index, key);
                }
                Step::Separator(index) => {
                    let left = self.fetch(node.children[index])?;
                    let right = self.fetch(node.children[index + 1])?;
                    let plan = rebalance::on_separator(index, left.len(), right.len(), t);
                    (plan, left, right)
                }
                Step::Descend(index) => {
                    let child = self.fetch(node.children[index])?;
                    if child.len() >= t {
                        address = node.child_slot(index);
                        depend = node.address;
                        node = child;
                        continue;
                    }

                    let left = match index.checked_sub(1) {
                        Some(i) => Some(self.fetch(node.children[i])?),
                        None => None,
                    };
                    let right = match node.children.get(index + 1) {
                        Some(&pointer) => Some(self.fetch(pointer)?),
                        None => None,
                    };
                    let plan = rebalance::on_descent(
                        index,
                        child.len(),
                        left.as_ref().map(IndexNode::len),
                        right.as_ref().map(IndexNode::len),
                        t,
                    )
                    .ok_or_else(|| invariant("internal node child has no siblings"))?;

                    match (plan.fixup, left, right) {
                        (Fixup::RotateLeft | Fixup::MergeLeft, Some(left), _) => (plan, left, child),
                        (Fixup::RotateRight | Fixup::MergeRight, _, Some(right)) => (plan, child, right),
                        _ => return Err(invariant("rebalance chose a missing sibling")),
                    }
                }
            };

            let previous = node.address;
            let next = self.apply(address, &mut node, plan, left, right, depend)?;

            if address == ROOT_SLOT && node.is_empty() {
                // The merged child replaces an emptied root.
                self.retire(&node);
                self.repoint(ROOT_SLOT, previous, next.address, 0);
                depend = 0;
            } else {
                address = node.child_slot(plan.next);
                depend = node.address;
            }
            node = next;
        }
    }

    /// Queue the staged writes and publish the new root.
    ///
    /// Returns `true` when the caller must start a drain loop. Only the root
    /// refresh can fail, and it runs before anything is committed.
    pub fn finish(&mut self) -> Result<bool> {
        let root = self.refreshed_root()?;

        let mut start_drain = false;
        for (address, command) in std::mem::take(&mut self.commands) {
            self.inner.tracker.add_command(self.task);
            start_drain |= self
                .inner
                .writes
                .push(address, self.task, command.data, command.depend);
        }
        self.inner.root = Arc::new(root);

        if self.inner.tracker.commands(self.task) == Some(0) {
            self.inner.retire_idle();
        }
        Ok(start_drain)
    }

    /// Undo the mutation's bookkeeping after a failure.
    ///
    /// Space it allocated stays leaked; value records it wrote are tombstoned
    /// so a later repair does not resurrect them.
    pub fn abandon(&mut self) {
        for address in std::mem::take(&mut self.written) {
            if let Err(e) = self.write_inline(address, &[VALUE_TAG_DEAD]) {
                tracing::warn!("failed to tombstone aborted value at {address}: {e}");
            }
        }
        self.inner.tracker.abandon(self.task);
        self.inner.retire_idle();
    }

    fn replace<V: Value>(
        &mut self,
        slot: u64,
        pointer: u64,
        depend: u64,
        key: K,
        value: V,
    ) -> Result<()> {
        let old: ValueNode<K, V> = self.read_value(pointer)?;
        if old.key != key {
            return Err(invariant(format!("value record at {pointer} holds another key")));
        }
        if old.value == value {
            return Ok(());
        }

        let mut record = ValueNode::new(key, value);
        let bytes = self.codec.encode_value(&mut record)?;
        record.address = self.file.grow(record.size);
        self.write_inline(record.address, &bytes)?;
        self.written.push(record.address);

        self.write_inline(old.address, &[VALUE_TAG_DEAD])?;
        self.inner.tracker.add_reclaim(self.task, old.address, old.size);
        self.repoint(slot, old.address, record.address, depend);
        Ok(())
    }

    fn insert<V: Value>(
        &mut self,
        address: u64,
        depend: u64,
        mut leaf: IndexNode<K>,
        index: usize,
        key: K,
        value: V,
    ) -> Result<()> {
        let original = leaf.clone();

        let mut record = ValueNode::new(key, value);
        let bytes = self.codec.encode_value(&mut record)?;
        record.address = self.malloc(record.size);
        self.write_inline(record.address, &bytes)?;
        self.written.push(record.address);

        leaf.keys.insert(index, record.key);
        leaf.values.insert(index, record.address);
        let leaf_bytes = self.place(&mut leaf)?;

        self.retire(&original);
        self.publish(&leaf, leaf_bytes);
        self.repoint(address, original.address, leaf.address, depend);
        Ok(())
    }

    /// Split full `child`, the `index`-th child of `parent`, around its median.
    ///
    /// `parent` may be a fresh, unplaced root. Returns the two halves.
    fn split(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        index: usize,
        mut child: IndexNode<K>,
        depend: u64,
    ) -> Result<(IndexNode<K>, IndexNode<K>)> {
        let original_parent = parent.clone();
        let original_child = child.clone();
        let previous = if parent.address == 0 {
            child.address
        } else {
            parent.address
        };

        let middle = (child.len() - 1) / 2 + 1;
        let mut sibling = if child.is_leaf {
            IndexNode::leaf()
        } else {
            IndexNode::internal()
        };
        sibling.keys = child.keys.split_off(middle);
        sibling.values = child.values.split_off(middle);
        if !child.is_leaf {
            sibling.children = child.children.split_off(middle);
        }
        let (Some(key), Some(value)) = (child.keys.pop(), child.values.pop()) else {
            return Err(invariant("split of an empty node"));
        };
        parent.keys.insert(index, key);
        parent.values.insert(index, value);

        let child_bytes = self.place(&mut child)?;
        let sibling_bytes = self.place(&mut sibling)?;
        parent.children[index] = child.address;
        parent.children.insert(index + 1, sibling.address);
        let parent_bytes = self.place(parent)?;

        self.retire(&original_parent);
        self.retire(&original_child);
        self.publish(parent, parent_bytes);
        self.publish(&child, child_bytes);
        self.publish(&sibling, sibling_bytes);
        self.repoint(address, previous, parent.address, depend);
        Ok((child, sibling))
    }

    fn apply(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        plan: Plan,
        left: IndexNode<K>,
        right: IndexNode<K>,
        depend: u64,
    ) -> Result<IndexNode<K>> {
        let separator = plan.separator;
        match plan.fixup {
            Fixup::RotateLeft => {
                let (left, right) = self.rotate_left(address, parent, separator, left, right, depend)?;
                Ok(if plan.next == separator { left } else { right })
            }
            Fixup::RotateRight => {
                let (left, right) = self.rotate_right(address, parent, separator, left, right, depend)?;
                Ok(if plan.next == separator { left } else { right })
            }
            Fixup::MergeLeft => self.merge_left(address, parent, separator, left, right, depend),
            Fixup::MergeRight => self.merge_right(address, parent, separator, left, right, depend),
        }
    }

    /// Move the left child's last key up and the separator down to the right.
    fn rotate_left(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        separator: usize,
        mut left: IndexNode<K>,
        mut right: IndexNode<K>,
        depend: u64,
    ) -> Result<(IndexNode<K>, IndexNode<K>)> {
        let originals = [parent.clone(), left.clone(), right.clone()];

        let (Some(key), Some(value)) = (left.keys.pop(), left.values.pop()) else {
            return Err(invariant("rotation from an empty node"));
        };
        let down_key = std::mem::replace(&mut parent.keys[separator], key);
        let down_value = std::mem::replace(&mut parent.values[separator], value);
        right.keys.insert(0, down_key);
        right.values.insert(0, down_value);
        if !left.is_leaf {
            let child = left
                .children
                .pop()
                .ok_or_else(|| invariant("internal node without children"))?;
            right.children.insert(0, child);
        }

        self.commit_pair(address, parent, separator, &originals, left, right, depend)
    }

    /// Move the right child's first key up and the separator down to the left.
    fn rotate_right(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        separator: usize,
        mut left: IndexNode<K>,
        mut right: IndexNode<K>,
        depend: u64,
    ) -> Result<(IndexNode<K>, IndexNode<K>)> {
        if right.is_empty() || (!right.is_leaf && right.children.is_empty()) {
            return Err(invariant("rotation from an empty node"));
        }
        let originals = [parent.clone(), left.clone(), right.clone()];

        let key = right.keys.remove(0);
        let value = right.values.remove(0);
        let down_key = std::mem::replace(&mut parent.keys[separator], key);
        let down_value = std::mem::replace(&mut parent.values[separator], value);
        left.keys.push(down_key);
        left.values.push(down_value);
        if !right.is_leaf {
            left.children.push(right.children.remove(0));
        }

        self.commit_pair(address, parent, separator, &originals, left, right, depend)
    }

    /// Place both children and the parent of a rotation.
    #[allow(clippy::too_many_arguments)]
    fn commit_pair(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        separator: usize,
        originals: &[IndexNode<K>; 3],
        mut left: IndexNode<K>,
        mut right: IndexNode<K>,
        depend: u64,
    ) -> Result<(IndexNode<K>, IndexNode<K>)> {
        let left_bytes = self.place(&mut left)?;
        let right_bytes = self.place(&mut right)?;
        parent.children[separator] = left.address;
        parent.children[separator + 1] = right.address;
        let parent_bytes = self.place(parent)?;

        for original in originals {
            self.retire(original);
        }
        self.publish(parent, parent_bytes);
        self.publish(&left, left_bytes);
        self.publish(&right, right_bytes);
        self.repoint(address, originals[0].address, parent.address, depend);
        Ok((left, right))
    }

    /// Fold `left` and the separator into the front of `right`.
    fn merge_left(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        separator: usize,
        left: IndexNode<K>,
        mut right: IndexNode<K>,
        depend: u64,
    ) -> Result<IndexNode<K>> {
        let original_parent = parent.clone();
        let original_right = right.clone();

        let key = parent.keys.remove(separator);
        let value = parent.values.remove(separator);
        parent.children.remove(separator);

        let mut keys = left.keys.clone();
        keys.push(key);
        keys.append(&mut right.keys);
        right.keys = keys;

        let mut values = left.values.clone();
        values.push(value);
        values.append(&mut right.values);
        right.values = values;

        if !left.is_leaf {
            let mut children = left.children.clone();
            children.append(&mut right.children);
            right.children = children;
        }

        let right_bytes = self.place(&mut right)?;
        parent.children[separator] = right.address;
        let parent_bytes = self.place(parent)?;

        self.retire(&original_parent);
        self.retire(&original_right);
        self.retire(&left);
        self.publish(parent, parent_bytes);
        self.publish(&right, right_bytes);
        self.repoint(address, original_parent.address, parent.address, depend);
        Ok(right)
    }

    /// Append the separator and `right` to `left`.
    fn merge_right(
        &mut self,
        address: u64,
        parent: &mut IndexNode<K>,
        separator: usize,
        mut left: IndexNode<K>,
        right: IndexNode<K>,
        depend: u64,
    ) -> Result<IndexNode<K>> {
        let original_parent = parent.clone();
        let original_left = left.clone();

        let key = parent.keys.remove(separator);
        let value = parent.values.remove(separator);
        parent.children.remove(separator + 1);

        left.keys.push(key);
        left.keys.extend(right.keys.iter().cloned());
        left.values.push(value);
        left.values.extend_from_slice(&right.values);
        if !right.is_leaf {
            left.children.extend_from_slice(&right.children);
        }

        let left_bytes = self.place(&mut left)?;
        parent.children[separator] = left.address;
        let parent_bytes = self.place(parent)?;

        self.retire(&original_parent);
        self.retire(&original_left);
        self.retire(&right);
        self.publish(parent, parent_bytes);
        self.publish(&left, left_bytes);
        self.repoint(address, original_parent.address, parent.address, depend);
        Ok(left)
    }

    fn delete_from_leaf<V: Value>(
        &mut self,
        address: u64,
        depend: u64,
        mut leaf: IndexNode<K>,
        index: usize,
        key: &K,
    ) -> Result<()> {
        let original = leaf.clone();
        let record: ValueNode<K, V> = self.read_value(leaf.values[index])?;
        if record.key != *key {
            return Err(invariant(format!(
                "value record at {} holds another key",
                record.address
            )));
        }

        leaf.keys.remove(index);
        leaf.values.remove(index);
        let bytes = self.place(&mut leaf)?;

        self.write_inline(record.address, &[VALUE_TAG_DEAD])?;
        self.inner.tracker.add_reclaim(self.task, record.address, record.size);
        self.retire(&original);
        self.publish(&leaf, bytes);
        self.repoint(address, original.address, leaf.address, depend);
        Ok(())
    }

    /// The root as this task leaves it.
    fn refreshed_root(&self) -> Result<IndexNode<K>> {
        let tracker = &self.inner.tracker;
        let current = &self.inner.root;
        let address = tracker
            .resolve_pointer(self.task, ROOT_SLOT, 0)
            .unwrap_or(current.address);

        let mut root = if address == current.address {
            IndexNode::clone(current)
        } else {
            match tracker.materialize_node(self.task, address, 0) {
                Some(node) => node,
                None => self.read_node(address)?,
            }
        };
        time_travel(tracker, self.task, &mut root);
        Ok(root)
    }

    /// Load the node at `address` as this task sees it.
    fn fetch(&self, address: u64) -> Result<IndexNode<K>> {
        let mut node = match self.inner.tracker.materialize_node(self.task, address, 0) {
            Some(node) => node,
            None => self.read_node(address)?,
        };
        time_travel(&self.inner.tracker, self.task, &mut node);
        Ok(node)
    }

    fn read_node(&self, address: u64) -> Result<IndexNode<K>> {
        let mut reader = BufReader::new(&self.inner.file);
        reader.seek(SeekFrom::Start(address))?;
        self.codec.decode_node(&mut reader, address)
    }

    fn read_value<V: Value>(&self, address: u64) -> Result<ValueNode<K, V>> {
        let mut reader = BufReader::new(&self.inner.file);
        reader.seek(SeekFrom::Start(address))?;
        self.codec.decode_value(&mut reader, address)
    }

    fn write_inline(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut file: &File = &self.inner.file;
        file.seek(SeekFrom::Start(address))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn malloc(&mut self, size: u64) -> u64 {
        self.inner.malloc(self.file, size)
    }

    /// Encode `node` and give it a new address.
    fn place(&mut self, node: &mut IndexNode<K>) -> Result<Vec<u8>> {
        let bytes = self.codec.encode_node(node)?;
        node.address = self.malloc(node.size);
        Ok(bytes)
    }

    /// Logically delete a node that is being replaced.
    fn retire(&mut self, node: &IndexNode<K>) {
        if node.address == 0 {
            return;
        }
        self.inner.tracker.add_reclaim(self.task, node.address, node.size);
        self.commands.remove(&node.address);
        self.inner
            .tracker
            .record(self.task, node.address, Some(Version::node(node)), None);
    }

    /// Record a freshly placed node and stage its bytes.
    fn publish(&mut self, node: &IndexNode<K>, bytes: Vec<u8>) {
        self.inner
            .tracker
            .record(self.task, node.address, None, Some(Version::node(node)));
        self.commands.insert(node.address, Command { data: bytes, depend: 0 });
    }

    /// Point `slot` at `new` and stage the pointer write.
    fn repoint(&mut self, slot: u64, old: u64, new: u64, depend: u64) {
        let head = (old != 0).then_some(Version::Pointer(old));
        self.inner
            .tracker
            .record(self.task, slot, head, Some(Version::Pointer(new)));
        self.commands.insert(
            slot,
            Command {
                data: encode_pointer(new),
                depend,
            },
        );
    }
}

fn invariant(message: impl Into<String>) -> StoreError {
    StoreError::Invariant(message.into())
}
