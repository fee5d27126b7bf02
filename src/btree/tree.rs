//! B-tree core implementation.
//!
//! This module provides the main BTreeIndex struct with operations for:
//! - try_get_value / contains_key: point lookups
//! - insert: preemptive-split insertion and updates
//! - remove: removal with top-down rebalancing
//! - traverse: ordered iteration
//! - validate: structural checking of a frozen tree
//!
//! All structural state lives on the page storage; the tree itself owns
//! only its header (root page, pair count) and the session bookkeeping.

use crate::btree::iter::Traversal;
use crate::btree::layout::NodeLayout;
use crate::btree::node::{Node, SlotSearch};
use crate::codec::{FixedSizeCodec, KeyCodec};
use crate::error::{Result, TreeError};
use crate::storage::PageStorage;
use crate::types::{CancellationToken, PageIndex, TreeHeader, TreeOptions};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// What an insertion did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Whether the tree changed (a pair was added or a value replaced)
    pub changed: bool,
    /// Whether the key was already present before the call
    pub already_existed: bool,
}

impl InsertOutcome {
    fn unchanged(already_existed: bool) -> Self {
        Self {
            changed: false,
            already_existed,
        }
    }
}

/// A page-backed B-tree index from keys of type `K` to values of type `V`
pub struct BTreeIndex<K, V> {
    storage: Arc<dyn PageStorage>,
    key_codec: Box<dyn KeyCodec<K>>,
    value_codec: Box<dyn FixedSizeCodec<V>>,
    layout: NodeLayout,
    max_move_pair_count: usize,
    state: RwLock<TreeHeader>,
    /// Held across every mutating operation: one mutating session at a time
    mutation: Mutex<()>,
    /// Live traversal iterators; mutations refuse while nonzero
    active_traversals: AtomicUsize,
}

impl<K, V> BTreeIndex<K, V> {
    /// Create an empty tree over the given storage.
    ///
    /// Rejects a page size too small for the minimum node capacity, a key
    /// codec narrower than one byte, and a zero move-buffer bound.
    pub fn new(
        storage: Arc<dyn PageStorage>,
        key_codec: Box<dyn KeyCodec<K>>,
        value_codec: Box<dyn FixedSizeCodec<V>>,
        options: TreeOptions,
    ) -> Result<Self> {
        Self::open(storage, key_codec, value_codec, options, TreeHeader::empty())
    }

    /// Resume a tree from a header the host persisted earlier
    pub fn open(
        storage: Arc<dyn PageStorage>,
        key_codec: Box<dyn KeyCodec<K>>,
        value_codec: Box<dyn FixedSizeCodec<V>>,
        options: TreeOptions,
        header: TreeHeader,
    ) -> Result<Self> {
        let layout = NodeLayout::new(
            key_codec.data_size(),
            value_codec.data_size(),
            storage.page_size(),
        )?;
        if options.max_move_pair_count < 1 {
            return Err(TreeError::invalid_argument(
                "max_move_pair_count must be at least 1",
            ));
        }
        if header.pair_count < 0 || (header.root_page_index.is_none() && header.pair_count != 0) {
            return Err(TreeError::invalid_argument(format!(
                "implausible tree header: no root but {} pairs",
                header.pair_count
            )));
        }

        Ok(Self {
            storage,
            key_codec,
            value_codec,
            layout,
            max_move_pair_count: options.max_move_pair_count,
            state: RwLock::new(header),
            mutation: Mutex::new(()),
            active_traversals: AtomicUsize::new(0),
        })
    }

    pub(crate) fn storage(&self) -> &dyn PageStorage {
        self.storage.as_ref()
    }

    pub(crate) fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub(crate) fn key_codec(&self) -> &dyn KeyCodec<K> {
        self.key_codec.as_ref()
    }

    pub(crate) fn value_codec(&self) -> &dyn FixedSizeCodec<V> {
        self.value_codec.as_ref()
    }

    pub(crate) fn max_move_pair_count(&self) -> usize {
        self.max_move_pair_count
    }

    pub(crate) fn ensure_mutable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TreeError::invalid_mode("tree is read-only"));
        }
        Ok(())
    }

    fn ensure_not_traversing(&self) -> Result<()> {
        if self.active_traversals.load(AtomicOrdering::SeqCst) > 0 {
            return Err(TreeError::invalid_mode(
                "tree is locked by an active traversal",
            ));
        }
        Ok(())
    }

    pub(crate) fn begin_traversal(&self) {
        self.active_traversals.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub(crate) fn end_traversal(&self) {
        self.active_traversals.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    /// Number of key/value pairs in the tree
    pub fn len(&self) -> u64 {
        self.state.read().pair_count as u64
    }

    /// Whether the tree holds no pairs
    pub fn is_empty(&self) -> bool {
        self.state.read().root_page_index.is_none()
    }

    /// Whether the underlying storage refuses mutation
    pub fn is_read_only(&self) -> bool {
        self.storage.is_read_only()
    }

    /// Snapshot of the persistent header fields, for the host to store
    pub fn header(&self) -> TreeHeader {
        *self.state.read()
    }

    /// Node geometry derived at construction
    pub fn node_layout(&self) -> NodeLayout {
        self.layout
    }

    fn attach_checked(&self, page: PageIndex) -> Result<Node<'_, K, V>> {
        if !self.storage.is_page_on_storage(page.value())
            || !self.storage.is_page_allocated(page.value())
        {
            return Err(TreeError::corruption(format!(
                "tree root points at unallocated page {page}"
            )));
        }
        Ok(Node::new(self, page))
    }

    pub(crate) fn root_node(&self) -> Result<Option<Node<'_, K, V>>> {
        let root = self.state.read().root_page_index;
        match root {
            Some(page) => Ok(Some(self.attach_checked(page)?)),
            None => Ok(None),
        }
    }

    /// Walk from the root to the slot holding `key`, polling the
    /// cancellation token between nodes
    fn find_slot(
        &self,
        key: &K,
        cancel: &CancellationToken,
    ) -> Result<Option<(Node<'_, K, V>, usize)>> {
        let Some(mut node) = self.root_node()? else {
            return Ok(None);
        };
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match node.search(key)? {
                SlotSearch::Found(i) => return Ok(Some((node, i))),
                SlotSearch::Missing(i) => {
                    if node.is_leaf()? {
                        return Ok(None);
                    }
                    node = node.get_child(i)?.ok_or_else(|| {
                        TreeError::corruption(format!(
                            "internal node {} lacks child {}",
                            node.page_index(),
                            i
                        ))
                    })?;
                }
            }
        }
    }

    /// Look up a key. A cancelled lookup reports `None`.
    pub fn try_get_value(&self, key: &K, cancel: &CancellationToken) -> Result<Option<V>> {
        match self.find_slot(key, cancel)? {
            Some((node, i)) => Ok(Some(node.get_value(i)?)),
            None => Ok(None),
        }
    }

    /// Check for a key. A cancelled check reports `false`.
    pub fn contains_key(&self, key: &K, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.find_slot(key, cancel)?.is_some())
    }

    /// Insert a pair, or update the value of an existing key when
    /// `update_if_exists` is set.
    ///
    /// Allocation refusal by the storage is not an error: structural
    /// growth is abandoned (splits already performed stay, they are legal
    /// transformations) and the call degrades to an update-only walk,
    /// reporting `changed: false` for a key the tree does not hold.
    pub fn insert(&self, key: &K, value: &V, update_if_exists: bool) -> Result<InsertOutcome> {
        self.ensure_mutable()?;
        let _session = self.mutation.lock();
        self.ensure_not_traversing()?;

        let root = self.state.read().root_page_index;
        let Some(root) = root else {
            return self.insert_first_pair(key, value);
        };

        let mut node = self.attach_checked(root)?;
        if node.pair_count()? == self.layout.max_pair_count {
            match self.split_root(root)? {
                Some(new_root) => node = new_root,
                None => return self.insert_no_growth(key, value, update_if_exists),
            }
        }

        loop {
            match node.search(key)? {
                SlotSearch::Found(i) => {
                    return if update_if_exists {
                        node.set_value(i, value)?;
                        Ok(InsertOutcome {
                            changed: true,
                            already_existed: true,
                        })
                    } else {
                        Ok(InsertOutcome::unchanged(true))
                    };
                }
                SlotSearch::Missing(i) => {
                    if node.is_leaf()? {
                        node.insert_at_leaf(i, key, value)?;
                        self.state.write().pair_count += 1;
                        return Ok(InsertOutcome {
                            changed: true,
                            already_existed: false,
                        });
                    }

                    let child = node.get_child(i)?.ok_or_else(|| {
                        TreeError::corruption(format!(
                            "internal node {} lacks child {}",
                            node.page_index(),
                            i
                        ))
                    })?;
                    if child.pair_count()? < self.layout.max_pair_count {
                        node = child;
                        continue;
                    }

                    let Some(partner) = self.storage.try_allocate_page()? else {
                        return self.insert_no_growth(key, value, update_if_exists);
                    };
                    node.split_child(i, PageIndex::new(partner))?;

                    // The slot at `i` now holds the promoted middle key;
                    // re-aim the descent against it.
                    let promoted = node.get_key(i)?;
                    match self.key_codec.compare(key, &promoted) {
                        Ordering::Equal => {
                            return if update_if_exists {
                                node.set_value(i, value)?;
                                Ok(InsertOutcome {
                                    changed: true,
                                    already_existed: true,
                                })
                            } else {
                                Ok(InsertOutcome::unchanged(true))
                            };
                        }
                        Ordering::Less => {
                            node = node.get_child(i)?.ok_or_else(|| {
                                TreeError::corruption("split left half is absent")
                            })?;
                        }
                        Ordering::Greater => {
                            node = node.get_child(i + 1)?.ok_or_else(|| {
                                TreeError::corruption("split right half is absent")
                            })?;
                        }
                    }
                }
            }
        }
    }

    /// Allocate a leaf root holding the single first pair
    fn insert_first_pair(&self, key: &K, value: &V) -> Result<InsertOutcome> {
        let Some(page) = self.storage.try_allocate_page()? else {
            return Ok(InsertOutcome::unchanged(false));
        };
        let page = PageIndex::new(page);
        let root = Node::new(self, page);
        root.init(true)?;
        root.set_pair_count(1)?;
        root.set_key(0, key)?;
        root.set_value(0, value)?;

        let mut state = self.state.write();
        state.root_page_index = Some(page);
        state.pair_count = 1;
        Ok(InsertOutcome {
            changed: true,
            already_existed: false,
        })
    }

    /// Split a full root under a fresh internal root.
    ///
    /// The new root is temporarily given one (garbage) pair so the old
    /// root can hang off child 0 and be split like any other child; the
    /// count is then put back to 1, which is exactly the pair the split
    /// promoted. Returns `None` when either allocation is refused; the
    /// first page is handed back and the caller falls to the update-only
    /// path.
    fn split_root(&self, old_root: PageIndex) -> Result<Option<Node<'_, K, V>>> {
        let Some(new_root_page) = self.storage.try_allocate_page()? else {
            return Ok(None);
        };
        let Some(partner_page) = self.storage.try_allocate_page()? else {
            self.storage.free_page(new_root_page)?;
            return Ok(None);
        };

        let new_root = Node::new(self, PageIndex::new(new_root_page));
        new_root.init(false)?;
        new_root.set_pair_count(1)?;
        new_root.set_child(0, Some(old_root))?;
        new_root.set_child(1, None)?;
        new_root.split_child(0, PageIndex::new(partner_page))?;
        new_root.set_pair_count(1)?;

        self.state.write().root_page_index = Some(PageIndex::new(new_root_page));
        Ok(Some(new_root))
    }

    /// Non-growing walk used when the storage refuses to allocate: only
    /// an existing key can be served.
    fn insert_no_growth(&self, key: &K, value: &V, update_if_exists: bool) -> Result<InsertOutcome> {
        let Some(mut node) = self.root_node()? else {
            return Ok(InsertOutcome::unchanged(false));
        };
        loop {
            match node.search(key)? {
                SlotSearch::Found(i) => {
                    return if update_if_exists {
                        node.set_value(i, value)?;
                        Ok(InsertOutcome {
                            changed: true,
                            already_existed: true,
                        })
                    } else {
                        Ok(InsertOutcome::unchanged(true))
                    };
                }
                SlotSearch::Missing(i) => {
                    if node.is_leaf()? {
                        return Ok(InsertOutcome::unchanged(false));
                    }
                    node = node.get_child(i)?.ok_or_else(|| {
                        TreeError::corruption(format!(
                            "internal node {} lacks child {}",
                            node.page_index(),
                            i
                        ))
                    })?;
                }
            }
        }
    }

    /// Remove a key, returning its value
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_mutable()?;
        let _session = self.mutation.lock();
        self.ensure_not_traversing()?;

        let Some(root) = self.root_node()? else {
            return Ok(None);
        };
        let removed = self.remove_from(&root, key)?;
        if removed.is_none() {
            return Ok(None);
        }

        if root.pair_count()? == 0 {
            let old_root = root.page_index();
            if root.is_leaf()? {
                self.state.write().root_page_index = None;
            } else {
                let only_child = root.child_index(0)?.ok_or_else(|| {
                    TreeError::corruption(format!("collapsed root {old_root} has no child"))
                })?;
                self.state.write().root_page_index = Some(only_child);
            }
            // The root pointer has moved on; only now is the page freed.
            self.storage.free_page(old_root.value())?;
        }

        self.state.write().pair_count -= 1;
        Ok(removed)
    }

    fn remove_from<'t>(&'t self, node: &Node<'t, K, V>, key: &K) -> Result<Option<V>> {
        let min = self.layout.min_pair_count;
        match node.search(key)? {
            SlotSearch::Found(i) => {
                if node.is_leaf()? {
                    let old = node.get_value(i)?;
                    node.remove_at_leaf(i)?;
                    return Ok(Some(old));
                }

                let old = node.get_value(i)?;
                let left = node.get_child(i)?.ok_or_else(|| {
                    TreeError::corruption(format!(
                        "internal node {} lacks child {}",
                        node.page_index(),
                        i
                    ))
                })?;
                if left.pair_count()? > min {
                    let (pred_key, pred_value) = left.last_pair_of_subtree()?;
                    node.set_key(i, &pred_key)?;
                    node.set_value(i, &pred_value)?;
                    if self.remove_from(&left, &pred_key)?.is_none() {
                        return Err(TreeError::corruption(
                            "predecessor vanished during removal swap",
                        ));
                    }
                    return Ok(Some(old));
                }

                let right = node.get_child(i + 1)?.ok_or_else(|| {
                    TreeError::corruption(format!(
                        "internal node {} lacks child {}",
                        node.page_index(),
                        i + 1
                    ))
                })?;
                if right.pair_count()? > min {
                    let (succ_key, succ_value) = right.first_pair_of_subtree()?;
                    node.set_key(i, &succ_key)?;
                    node.set_value(i, &succ_value)?;
                    if self.remove_from(&right, &succ_key)?.is_none() {
                        return Err(TreeError::corruption(
                            "successor vanished during removal swap",
                        ));
                    }
                    return Ok(Some(old));
                }

                // Both flanking children sit at the minimum: fold them
                // around the key, then delete it from the merged node,
                // where it now lives exactly once as the former separator.
                let merged = node.merge_children(i)?;
                match self.remove_from(&merged, key)? {
                    Some(value) => Ok(Some(value)),
                    None => Err(TreeError::corruption(
                        "separator missing from freshly merged node",
                    )),
                }
            }
            SlotSearch::Missing(i) => {
                if node.is_leaf()? {
                    return Ok(None);
                }
                let child = node.get_child(i)?.ok_or_else(|| {
                    TreeError::corruption(format!(
                        "internal node {} lacks child {}",
                        node.page_index(),
                        i
                    ))
                })?;
                let child = if child.pair_count()? == min {
                    self.reinforce_child(node, i)?
                } else {
                    child
                };
                self.remove_from(&child, key)
            }
        }
    }

    /// Bring the at-minimum child at position `i` above the minimum
    /// before descending into it: borrow from a sibling when one has a
    /// pair to spare, merge with one otherwise. Returns the node to
    /// continue the descent from.
    fn reinforce_child<'t>(
        &'t self,
        parent: &Node<'t, K, V>,
        i: usize,
    ) -> Result<Node<'t, K, V>> {
        let min = self.layout.min_pair_count;
        let parent_count = parent.pair_count()?;

        if i > 0 {
            let left = parent.get_child(i - 1)?.ok_or_else(|| {
                TreeError::corruption(format!(
                    "internal node {} lacks child {}",
                    parent.page_index(),
                    i - 1
                ))
            })?;
            if left.pair_count()? > min {
                parent.rotate_from_left(i)?;
                return parent.get_child(i)?.ok_or_else(|| {
                    TreeError::corruption("rotated child is absent")
                });
            }
        }
        if i < parent_count {
            let right = parent.get_child(i + 1)?.ok_or_else(|| {
                TreeError::corruption(format!(
                    "internal node {} lacks child {}",
                    parent.page_index(),
                    i + 1
                ))
            })?;
            if right.pair_count()? > min {
                parent.rotate_from_right(i)?;
                return parent.get_child(i)?.ok_or_else(|| {
                    TreeError::corruption("rotated child is absent")
                });
            }
        }

        if i < parent_count {
            parent.merge_children(i)
        } else {
            parent.merge_children(i - 1)
        }
    }

    /// Iterate the tree in key order (or reverse key order).
    ///
    /// The tree is marked in-traversal for the iterator's lifetime;
    /// `insert` and `remove` refuse with an invalid-mode error until it
    /// is dropped.
    pub fn traverse(&self, ascending: bool) -> Result<Traversal<'_, K, V>> {
        // Wait out any in-flight mutation before the first page is read.
        drop(self.mutation.lock());
        let root = self.root_node()?;
        Traversal::new(self, root, ascending)
    }

    /// Structurally validate a frozen tree, raising corruption on any
    /// violated invariant. A cancelled validation returns early without a
    /// verdict.
    pub fn validate(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_read_only() {
            return Err(TreeError::invalid_mode("validation requires a read-only tree"));
        }

        let header = self.header();
        let Some(root) = self.root_node()? else {
            if header.pair_count != 0 {
                return Err(TreeError::corruption(format!(
                    "empty tree reports {} pairs",
                    header.pair_count
                )));
            }
            return Ok(());
        };

        let Some(summary) = self.validate_subtree(&root, None, None, true, cancel)? else {
            return Ok(());
        };
        if summary.pair_total != header.pair_count {
            return Err(TreeError::corruption(format!(
                "tree header reports {} pairs but {} are reachable",
                header.pair_count, summary.pair_total
            )));
        }
        Ok(())
    }

    fn validate_subtree<'t>(
        &'t self,
        node: &Node<'t, K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<SubtreeSummary>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let count = node.pair_count()?;
        let leaf = node.is_leaf()?;
        let min = self.layout.min_pair_count;
        if is_root {
            if count == 0 {
                return Err(TreeError::corruption(format!(
                    "root node {} holds no pairs",
                    node.page_index()
                )));
            }
        } else if count < min {
            return Err(TreeError::corruption(format!(
                "node {} holds {} pairs, below the minimum {}",
                node.page_index(),
                count,
                min
            )));
        }

        let mut keys = Vec::with_capacity(count);
        for j in 0..count {
            let key = node.get_key(j)?;
            if let Some(prev) = keys.last() {
                if self.key_codec.compare(prev, &key) != Ordering::Less {
                    return Err(TreeError::corruption(format!(
                        "node {} keys are not strictly ascending at slot {}",
                        node.page_index(),
                        j
                    )));
                }
            }
            if let Some(lo) = lower {
                if self.key_codec.compare(&key, lo) != Ordering::Greater {
                    return Err(TreeError::corruption(format!(
                        "node {} slot {} breaches its lower bound",
                        node.page_index(),
                        j
                    )));
                }
            }
            if let Some(hi) = upper {
                if self.key_codec.compare(&key, hi) != Ordering::Less {
                    return Err(TreeError::corruption(format!(
                        "node {} slot {} breaches its upper bound",
                        node.page_index(),
                        j
                    )));
                }
            }
            keys.push(key);
        }

        if leaf {
            return Ok(Some(SubtreeSummary {
                pair_total: count as i64,
                depth: 0,
            }));
        }

        let mut total = count as i64;
        let mut child_depth = None;
        for j in 0..=count {
            let child = node.get_child(j)?.ok_or_else(|| {
                TreeError::corruption(format!(
                    "internal node {} lacks child {}",
                    node.page_index(),
                    j
                ))
            })?;
            let child_lower = if j == 0 { lower } else { Some(&keys[j - 1]) };
            let child_upper = if j == count { upper } else { Some(&keys[j]) };
            let Some(summary) =
                self.validate_subtree(&child, child_lower, child_upper, false, cancel)?
            else {
                return Ok(None);
            };
            total += summary.pair_total;
            match child_depth {
                None => child_depth = Some(summary.depth),
                Some(depth) if depth != summary.depth => {
                    return Err(TreeError::corruption(format!(
                        "children of node {} sit at unequal depths",
                        node.page_index()
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Some(SubtreeSummary {
            pair_total: total,
            depth: child_depth.unwrap_or(0) + 1,
        }))
    }
}

struct SubtreeSummary {
    pair_total: i64,
    depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::I64Codec;
    use crate::storage::{FilePageStorage, MemoryPageStorage};
    use rand::prelude::*;

    // 137-byte pages hold exactly 5 pairs of i64 keys and values, the
    // smallest geometry the tree accepts: max_pair_count 5, min 2.
    const SMALL_PAGE: usize = 137;

    fn small_tree() -> (Arc<MemoryPageStorage>, BTreeIndex<i64, i64>) {
        let storage = Arc::new(MemoryPageStorage::new(SMALL_PAGE));
        let tree = BTreeIndex::new(
            storage.clone(),
            Box::new(I64Codec),
            Box::new(I64Codec),
            TreeOptions::default(),
        )
        .unwrap();
        (storage, tree)
    }

    fn fixed_tree(capacity: usize) -> (Arc<MemoryPageStorage>, BTreeIndex<i64, i64>) {
        let storage = Arc::new(MemoryPageStorage::with_fixed_capacity(SMALL_PAGE, capacity));
        let tree = BTreeIndex::new(
            storage.clone(),
            Box::new(I64Codec),
            Box::new(I64Codec),
            TreeOptions::default(),
        )
        .unwrap();
        (storage, tree)
    }

    /// Insert each key with itself as the value
    fn insert_all(tree: &BTreeIndex<i64, i64>, keys: &[i64]) {
        for &key in keys {
            let outcome = tree.insert(&key, &key, false).unwrap();
            assert!(outcome.changed, "insert of {key} was refused");
        }
    }

    fn ascending_keys(tree: &BTreeIndex<i64, i64>) -> Vec<i64> {
        tree.traverse(true)
            .unwrap()
            .map(|pair| pair.unwrap().0)
            .collect()
    }

    fn get(tree: &BTreeIndex<i64, i64>, key: i64) -> Option<i64> {
        tree.try_get_value(&key, &CancellationToken::new()).unwrap()
    }

    /// Freeze, validate, thaw
    fn check_valid(storage: &MemoryPageStorage, tree: &BTreeIndex<i64, i64>) {
        storage.set_read_only(true);
        tree.validate(&CancellationToken::new()).unwrap();
        storage.set_read_only(false);
    }

    #[test]
    fn test_empty_tree() {
        let (_storage, tree) = small_tree();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(get(&tree, 1), None);
        assert!(!tree.contains_key(&1, &CancellationToken::new()).unwrap());
        assert_eq!(tree.remove(&1).unwrap(), None);
        assert_eq!(ascending_keys(&tree), Vec::<i64>::new());
    }

    #[test]
    fn test_single_insert_and_remove() {
        let (storage, tree) = small_tree();
        assert_eq!(
            tree.insert(&5, &50, false).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: false
            }
        );
        assert_eq!(tree.len(), 1);
        assert_eq!(get(&tree, 5), Some(50));

        assert_eq!(tree.remove(&5).unwrap(), Some(50));
        assert!(tree.is_empty());
        assert_eq!(tree.header().root_page_index, None);
        // The root's page went back to the storage
        assert_eq!(storage.allocated_page_count(), 0);
    }

    #[test]
    fn test_mixed_inserts_split_root() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[10, 20, 5, 6, 12, 30, 7, 17]);

        assert_eq!(tree.len(), 8);
        assert_eq!(ascending_keys(&tree), vec![5, 6, 7, 10, 12, 17, 20, 30]);

        // The sixth insert split the root: one separator, two leaves
        let root = tree.root_node().unwrap().unwrap();
        assert!(!root.is_leaf().unwrap());
        assert_eq!(root.pair_count().unwrap(), 1);
        assert_eq!(root.get_key(0).unwrap(), 10);
        for i in 0..=1 {
            let child = root.get_child(i).unwrap().unwrap();
            assert!(child.is_leaf().unwrap());
            let count = child.pair_count().unwrap();
            assert!((2..=5).contains(&count));
        }

        check_valid(&storage, &tree);
    }

    #[test]
    fn test_remove_key_held_by_internal_node() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[10, 20, 5, 6, 12, 30, 7, 17]);

        assert_eq!(tree.remove(&10).unwrap(), Some(10));
        assert_eq!(tree.len(), 7);
        assert_eq!(ascending_keys(&tree), vec![5, 6, 7, 12, 17, 20, 30]);
        check_valid(&storage, &tree);
    }

    #[test]
    fn test_insert_without_updates() {
        let (_storage, tree) = small_tree();
        assert_eq!(
            tree.insert(&42, &100, false).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: false
            }
        );
        assert_eq!(
            tree.insert(&42, &200, false).unwrap(),
            InsertOutcome {
                changed: false,
                already_existed: true
            }
        );
        assert_eq!(get(&tree, 42), Some(100));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_insert_with_updates() {
        let (_storage, tree) = small_tree();
        assert_eq!(
            tree.insert(&42, &100, true).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: false
            }
        );
        assert_eq!(
            tree.insert(&42, &200, true).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: true
            }
        );
        assert_eq!(get(&tree, 42), Some(200));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_permutation_yields_sorted_traversal() {
        let (storage, tree) = small_tree();
        let mut keys: Vec<i64> = (0..200).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        insert_all(&tree, &keys);

        let sorted: Vec<i64> = (0..200).collect();
        assert_eq!(ascending_keys(&tree), sorted);

        let mut descending: Vec<i64> = tree
            .traverse(false)
            .unwrap()
            .map(|pair| pair.unwrap().0)
            .collect();
        descending.reverse();
        assert_eq!(descending, sorted);

        check_valid(&storage, &tree);
    }

    #[test]
    fn test_sequential_inserts_in_both_directions() {
        for forward in [true, false] {
            let (storage, tree) = small_tree();
            let keys: Vec<i64> = if forward {
                (0..300).collect()
            } else {
                (0..300).rev().collect()
            };
            insert_all(&tree, &keys);
            assert_eq!(tree.len(), 300);
            assert_eq!(ascending_keys(&tree), (0..300).collect::<Vec<_>>());
            for key in 0..300 {
                assert_eq!(get(&tree, key), Some(key));
            }
            check_valid(&storage, &tree);
        }
    }

    #[test]
    fn test_remove_everything_in_random_order() {
        let (storage, tree) = small_tree();
        let mut rng = StdRng::seed_from_u64(21);
        let mut keys: Vec<i64> = (0..150).collect();
        keys.shuffle(&mut rng);
        insert_all(&tree, &keys);

        keys.shuffle(&mut rng);
        for (n, &key) in keys.iter().enumerate() {
            assert_eq!(tree.remove(&key).unwrap(), Some(key));
            assert_eq!(tree.len(), (149 - n) as u64);
            if n % 10 == 0 && !tree.is_empty() {
                check_valid(&storage, &tree);
            }
        }
        assert!(tree.is_empty());
        assert_eq!(tree.header().root_page_index, None);
        assert_eq!(storage.allocated_page_count(), 0);
    }

    #[test]
    fn test_removal_collapses_root() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[10, 20, 5, 6, 12, 30, 7, 17]);
        assert!(!tree.root_node().unwrap().unwrap().is_leaf().unwrap());

        for key in [5, 6, 7, 10, 12, 30] {
            assert_eq!(tree.remove(&key).unwrap(), Some(key));
            check_valid(&storage, &tree);
        }

        // Two pairs left: the tree is a lone leaf again
        assert_eq!(ascending_keys(&tree), vec![17, 20]);
        let root = tree.root_node().unwrap().unwrap();
        assert!(root.is_leaf().unwrap());
    }

    #[test]
    fn test_first_insert_allocation_refused() {
        let (_storage, tree) = fixed_tree(0);
        assert_eq!(
            tree.insert(&1, &1, true).unwrap(),
            InsertOutcome {
                changed: false,
                already_existed: false
            }
        );
        assert!(tree.is_empty());
    }

    #[test]
    fn test_root_split_allocation_refused_midway() {
        // Room for the root leaf and one spare page: the root split gets
        // its first allocation, loses the second, and must hand the first
        // page back before falling to the update-only path.
        let (storage, tree) = fixed_tree(2);
        insert_all(&tree, &[1, 2, 3, 4, 5]);
        assert_eq!(storage.allocated_page_count(), 1);

        assert_eq!(
            tree.insert(&6, &6, true).unwrap(),
            InsertOutcome {
                changed: false,
                already_existed: false
            }
        );
        assert_eq!(storage.allocated_page_count(), 1);
        assert_eq!(tree.len(), 5);

        // Existing keys still update through the fallback
        assert_eq!(
            tree.insert(&3, &33, false).unwrap(),
            InsertOutcome {
                changed: false,
                already_existed: true
            }
        );
        assert_eq!(
            tree.insert(&3, &33, true).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: true
            }
        );
        assert_eq!(get(&tree, 3), Some(33));
        check_valid(&storage, &tree);
    }

    #[test]
    fn test_exhausted_storage_keeps_tree_consistent() {
        let (storage, tree) = fixed_tree(8);
        let mut inserted = Vec::new();
        for key in 0.. {
            let outcome = tree.insert(&key, &key, false).unwrap();
            if !outcome.changed {
                assert!(!outcome.already_existed);
                break;
            }
            inserted.push(key);
        }
        assert!(!inserted.is_empty());
        assert_eq!(tree.len(), inserted.len() as u64);

        // Another fresh key is still refused
        assert_eq!(
            tree.insert(&100_000, &1, true).unwrap(),
            InsertOutcome {
                changed: false,
                already_existed: false
            }
        );

        // Updates keep working and every stored pair survived
        let probe = inserted[inserted.len() / 2];
        assert_eq!(
            tree.insert(&probe, &-9, true).unwrap(),
            InsertOutcome {
                changed: true,
                already_existed: true
            }
        );
        assert_eq!(get(&tree, probe), Some(-9));
        for &key in &inserted {
            if key != probe {
                assert_eq!(get(&tree, key), Some(key));
            }
        }
        check_valid(&storage, &tree);
    }

    #[test]
    fn test_traversal_locks_out_mutation() {
        let (_storage, tree) = small_tree();
        insert_all(&tree, &[1, 2, 3]);

        {
            let mut walk = tree.traverse(true).unwrap();
            assert_eq!(walk.next().unwrap().unwrap(), (1, 1));

            assert!(matches!(
                tree.insert(&9, &9, true),
                Err(TreeError::InvalidMode(_))
            ));
            assert!(matches!(tree.remove(&1), Err(TreeError::InvalidMode(_))));
        }

        // The lock lifts with the iterator
        assert!(tree.insert(&9, &9, true).unwrap().changed);
    }

    #[test]
    fn test_reader_requires_read_only_tree() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[1, 2, 3]);

        assert!(matches!(
            crate::btree::TreeReader::new(&tree),
            Err(TreeError::InvalidMode(_))
        ));

        storage.set_read_only(true);
        let reader = crate::btree::TreeReader::new(&tree).unwrap();
        let root = reader.root_node().unwrap().unwrap();
        assert!(root.is_leaf().unwrap());
        assert_eq!(root.get_key(0).unwrap(), 1);
        assert_eq!(root.get_value(2).unwrap(), 3);
    }

    #[test]
    fn test_validate_requires_read_only_tree() {
        let (_storage, tree) = small_tree();
        assert!(matches!(
            tree.validate(&CancellationToken::new()),
            Err(TreeError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_validate_detects_bad_leaf_marker() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[1, 2, 3]);

        let root_page = tree.header().root_page_index.unwrap();
        storage.write_to(root_page.value(), 8, &[0x01]).unwrap();

        storage.set_read_only(true);
        assert!(matches!(
            tree.validate(&CancellationToken::new()),
            Err(TreeError::Corruption(_))
        ));
    }

    #[test]
    fn test_validate_detects_count_mismatch() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[1, 2, 3]);

        // Shrink the root's stored pair count to a plausible lie
        let root_page = tree.header().root_page_index.unwrap();
        storage
            .write_to(root_page.value(), 0, &2i64.to_le_bytes())
            .unwrap();

        storage.set_read_only(true);
        assert!(matches!(
            tree.validate(&CancellationToken::new()),
            Err(TreeError::Corruption(_))
        ));
    }

    #[test]
    fn test_cancelled_reads_report_nothing() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[1, 2, 3]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(tree.try_get_value(&2, &cancel).unwrap(), None);
        assert!(!tree.contains_key(&2, &cancel).unwrap());

        storage.set_read_only(true);
        tree.validate(&cancel).unwrap();
    }

    #[test]
    fn test_concurrent_readers_agree_with_single_thread() {
        let (storage, tree) = small_tree();
        let mut keys: Vec<i64> = (0..500).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(11));
        for &key in &keys {
            tree.insert(&key, &(key * 3), false).unwrap();
        }
        storage.set_read_only(true);

        std::thread::scope(|scope| {
            for seed in 0..4u64 {
                let tree = &tree;
                scope.spawn(move || {
                    let reader = crate::btree::TreeReader::new(tree).unwrap();
                    assert!(reader.root_node().unwrap().is_some());

                    let cancel = CancellationToken::new();
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..10_000 {
                        let key = rng.gen_range(0..1000);
                        let expected = if key < 500 { Some(key * 3) } else { None };
                        assert_eq!(tree.try_get_value(&key, &cancel).unwrap(), expected);
                    }
                });
            }
        });
    }

    #[test]
    fn test_constructor_contract() {
        let storage = Arc::new(MemoryPageStorage::new(SMALL_PAGE - 1));
        assert!(matches!(
            BTreeIndex::<i64, i64>::new(
                storage,
                Box::new(I64Codec),
                Box::new(I64Codec),
                TreeOptions::default(),
            ),
            Err(TreeError::InvalidArgument(_))
        ));

        let storage = Arc::new(MemoryPageStorage::new(SMALL_PAGE));
        assert!(matches!(
            BTreeIndex::<i64, i64>::new(
                storage,
                Box::new(I64Codec),
                Box::new(I64Codec),
                TreeOptions::new(0),
            ),
            Err(TreeError::InvalidArgument(_))
        ));

        let storage = Arc::new(MemoryPageStorage::new(SMALL_PAGE));
        let bad_header = TreeHeader {
            root_page_index: None,
            pair_count: 5,
        };
        assert!(matches!(
            BTreeIndex::<i64, i64>::open(
                storage,
                Box::new(I64Codec),
                Box::new(I64Codec),
                TreeOptions::default(),
                bad_header,
            ),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mutation_refused_on_read_only_tree() {
        let (storage, tree) = small_tree();
        insert_all(&tree, &[1]);
        storage.set_read_only(true);

        assert!(matches!(
            tree.insert(&2, &2, true),
            Err(TreeError::InvalidMode(_))
        ));
        assert!(matches!(tree.remove(&1), Err(TreeError::InvalidMode(_))));
        assert_eq!(get(&tree, 1), Some(1));
    }

    #[test]
    fn test_small_move_buffer_still_correct() {
        let storage = Arc::new(MemoryPageStorage::new(SMALL_PAGE));
        let tree = BTreeIndex::new(
            storage.clone(),
            Box::new(I64Codec),
            Box::new(I64Codec),
            TreeOptions::new(1),
        )
        .unwrap();

        let mut keys: Vec<i64> = (0..120).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(3));
        insert_all(&tree, &keys);
        assert_eq!(ascending_keys(&tree), (0..120).collect::<Vec<_>>());

        for key in (0..120).step_by(2) {
            assert_eq!(tree.remove(&key).unwrap(), Some(key));
        }
        assert_eq!(
            ascending_keys(&tree),
            (0..120).filter(|k| k % 2 == 1).collect::<Vec<_>>()
        );
        check_valid(&storage, &tree);
    }

    #[test]
    fn test_header_roundtrip_over_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.pages");
        let header_json;

        {
            let storage = Arc::new(FilePageStorage::create(&path, 256).unwrap());
            let tree = BTreeIndex::new(
                storage,
                Box::new(I64Codec),
                Box::new(I64Codec),
                TreeOptions::default(),
            )
            .unwrap();
            for key in 0..50 {
                tree.insert(&key, &(key * 7), false).unwrap();
            }
            header_json = serde_json::to_string(&tree.header()).unwrap();
        }

        let storage = Arc::new(FilePageStorage::open(&path).unwrap());
        let header: TreeHeader = serde_json::from_str(&header_json).unwrap();
        let tree = BTreeIndex::open(
            storage,
            Box::new(I64Codec),
            Box::new(I64Codec),
            TreeOptions::default(),
            header,
        )
        .unwrap();

        assert_eq!(tree.len(), 50);
        for key in 0..50 {
            assert_eq!(get(&tree, key), Some(key * 7));
        }
    }
}
