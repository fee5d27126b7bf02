//! B-tree node, stored in exactly one page.
//!
//! A `Node` is a light handle `{ tree, page_index }`; the data it fronts
//! lives on the page storage and survives the handle. Reads go through the
//! storage on demand, except for the two header fields the handle memoizes
//! (`pair_count`, `is_leaf`); those are write-through, which is sound
//! under the tree's single-writer model as long as no two live handles
//! mutate the same page.
//!
//! The public surface of a node is read-only; everything that writes is
//! crate-private so external code can only reach nodes through a
//! [`crate::TreeReader`] on a frozen tree.

use crate::btree::layout::{
    FIRST_CHILD_OFFSET, IS_LEAF_OFFSET, NODE_HEADER_SIZE, PAIR_COUNT_OFFSET,
};
use crate::btree::tree::BTreeIndex;
use crate::error::{Result, TreeError};
use crate::storage::PageStorage;
use crate::types::PageIndex;
use std::cell::Cell;
use std::cmp::Ordering;

/// Header byte marking a leaf node
const LEAF_MARKER: u8 = 0xFF;

/// Header byte marking an internal node
const INTERNAL_MARKER: u8 = 0x00;

/// Which side of a key a child pointer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildSide {
    Left,
    Right,
}

/// Result of a ceiling search over one node's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotSearch {
    /// The key sits at this slot
    Found(usize),
    /// The key is absent; this is the ceiling slot (equal to the pair
    /// count when every key is smaller than the probe)
    Missing(usize),
}

/// Handle to one on-page B-tree node
pub struct Node<'t, K, V> {
    tree: &'t BTreeIndex<K, V>,
    page: PageIndex,
    cached_pair_count: Cell<Option<usize>>,
    cached_is_leaf: Cell<Option<bool>>,
}

impl<'t, K, V> Node<'t, K, V> {
    pub(crate) fn new(tree: &'t BTreeIndex<K, V>, page: PageIndex) -> Self {
        Self {
            tree,
            page,
            cached_pair_count: Cell::new(None),
            cached_is_leaf: Cell::new(None),
        }
    }

    /// Page this node lives on
    pub fn page_index(&self) -> PageIndex {
        self.page
    }

    fn read_exact(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.tree.storage().read_from(self.page.value(), offset, buf)
    }

    fn write_exact(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.tree.storage().write_to(self.page.value(), offset, buf)
    }

    fn read_i64(&self, offset: usize) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(offset, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn write_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.write_exact(offset, &value.to_le_bytes())
    }

    /// Number of key/value pairs on this node
    pub fn pair_count(&self) -> Result<usize> {
        if let Some(count) = self.cached_pair_count.get() {
            return Ok(count);
        }
        let raw = self.read_i64(PAIR_COUNT_OFFSET)?;
        let max = self.tree.layout().max_pair_count;
        if raw < 0 || raw > max as i64 {
            return Err(TreeError::corruption(format!(
                "node {} reports {} pairs, outside [0, {}]",
                self.page, raw, max
            )));
        }
        let count = raw as usize;
        self.cached_pair_count.set(Some(count));
        Ok(count)
    }

    /// Whether this node is a leaf
    pub fn is_leaf(&self) -> Result<bool> {
        if let Some(leaf) = self.cached_is_leaf.get() {
            return Ok(leaf);
        }
        let mut buf = [0u8; 1];
        self.read_exact(IS_LEAF_OFFSET, &mut buf)?;
        let leaf = match buf[0] {
            LEAF_MARKER => true,
            INTERNAL_MARKER => false,
            other => {
                return Err(TreeError::corruption(format!(
                    "node {} has leaf marker 0x{:02X}",
                    self.page, other
                )))
            }
        };
        self.cached_is_leaf.set(Some(leaf));
        Ok(leaf)
    }

    pub(crate) fn set_pair_count(&self, count: usize) -> Result<()> {
        self.tree.ensure_mutable()?;
        if count > self.tree.layout().max_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "pair count {} exceeds the node capacity {}",
                count,
                self.tree.layout().max_pair_count
            )));
        }
        self.write_i64(PAIR_COUNT_OFFSET, count as i64)?;
        self.cached_pair_count.set(Some(count));
        Ok(())
    }

    pub(crate) fn set_is_leaf(&self, leaf: bool) -> Result<()> {
        self.tree.ensure_mutable()?;
        let marker = if leaf { LEAF_MARKER } else { INTERNAL_MARKER };
        self.write_exact(IS_LEAF_OFFSET, &[marker])?;
        self.cached_is_leaf.set(Some(leaf));
        Ok(())
    }

    /// Write a fresh header: no pairs, the given kind, no child 0
    pub(crate) fn init(&self, leaf: bool) -> Result<()> {
        self.tree.ensure_mutable()?;
        let mut header = [0u8; NODE_HEADER_SIZE];
        header[IS_LEAF_OFFSET] = if leaf { LEAF_MARKER } else { INTERNAL_MARKER };
        header[FIRST_CHILD_OFFSET..FIRST_CHILD_OFFSET + 8]
            .copy_from_slice(&PageIndex::encode_opt(None).to_le_bytes());
        self.write_exact(0, &header)?;
        self.cached_pair_count.set(Some(0));
        self.cached_is_leaf.set(Some(leaf));
        Ok(())
    }

    fn check_slot(&self, i: usize) -> Result<()> {
        let count = self.pair_count()?;
        if i >= count {
            return Err(TreeError::invalid_argument(format!(
                "slot {} out of bounds (node {} holds {} pairs)",
                i, self.page, count
            )));
        }
        Ok(())
    }

    /// Read the key at slot `i`
    pub fn get_key(&self, i: usize) -> Result<K> {
        self.check_slot(i)?;
        let layout = self.tree.layout();
        let mut buf = vec![0u8; layout.key_size];
        self.read_exact(layout.key_offset(i), &mut buf)?;
        Ok(self.tree.key_codec().decode(&buf))
    }

    /// Read the value at slot `i`
    pub fn get_value(&self, i: usize) -> Result<V> {
        self.check_slot(i)?;
        let layout = self.tree.layout();
        let mut buf = vec![0u8; layout.value_size];
        self.read_exact(layout.value_offset(i), &mut buf)?;
        Ok(self.tree.value_codec().decode(&buf))
    }

    pub(crate) fn set_key(&self, i: usize, key: &K) -> Result<()> {
        self.tree.ensure_mutable()?;
        self.check_slot(i)?;
        let layout = self.tree.layout();
        let mut buf = vec![0u8; layout.key_size];
        self.tree.key_codec().encode(key, &mut buf);
        self.write_exact(layout.key_offset(i), &buf)
    }

    pub(crate) fn set_value(&self, i: usize, value: &V) -> Result<()> {
        self.tree.ensure_mutable()?;
        self.check_slot(i)?;
        let layout = self.tree.layout();
        let mut buf = vec![0u8; layout.value_size];
        self.tree.value_codec().encode(value, &mut buf);
        self.write_exact(layout.value_offset(i), &buf)
    }

    fn check_child_position(&self, i: usize) -> Result<()> {
        if self.is_leaf()? {
            return Err(TreeError::invalid_argument(format!(
                "leaf node {} has no child pointers",
                self.page
            )));
        }
        let count = self.pair_count()?;
        if i > count {
            return Err(TreeError::invalid_argument(format!(
                "child position {} out of bounds (node {} holds {} pairs)",
                i, self.page, count
            )));
        }
        Ok(())
    }

    /// Read child pointer `i` without following it
    pub(crate) fn child_index(&self, i: usize) -> Result<Option<PageIndex>> {
        self.check_child_position(i)?;
        let raw = self.read_i64(self.tree.layout().child_offset(i))?;
        PageIndex::decode_opt(raw).map_err(|bad| {
            TreeError::corruption(format!(
                "node {} child {} holds invalid page index {}",
                self.page, i, bad
            ))
        })
    }

    pub(crate) fn set_child(&self, i: usize, child: Option<PageIndex>) -> Result<()> {
        self.tree.ensure_mutable()?;
        self.check_child_position(i)?;
        self.write_i64(
            self.tree.layout().child_offset(i),
            PageIndex::encode_opt(child),
        )
    }

    /// Follow child pointer `i`.
    ///
    /// A stored `-1` yields `Ok(None)`. A pointer to a page that is not on
    /// storage, or not allocated, is corruption.
    pub fn get_child(&self, i: usize) -> Result<Option<Node<'t, K, V>>> {
        let Some(child) = self.child_index(i)? else {
            return Ok(None);
        };
        let storage = self.tree.storage();
        if !storage.is_page_on_storage(child.value()) || !storage.is_page_allocated(child.value())
        {
            return Err(TreeError::corruption(format!(
                "node {} child {} points at unallocated page {}",
                self.page, i, child
            )));
        }
        Ok(Some(Node::new(self.tree, child)))
    }

    /// Ceiling binary search for `key` over this node's slots
    pub(crate) fn search(&self, key: &K) -> Result<SlotSearch> {
        let mut lo = 0;
        let mut hi = self.pair_count()?;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = self.get_key(mid)?;
            match self.tree.key_codec().compare(key, &probe) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(SlotSearch::Found(mid)),
            }
        }
        Ok(SlotSearch::Missing(lo))
    }

    /// Move `amount` whole slots from `src` starting at `src_at` to this
    /// node starting at `dst_at`.
    ///
    /// The move is chunked by the tree's `max_move_pair_count`; when source
    /// and destination ranges overlap on the same page, chunks are
    /// processed back-to-front so no unread slot is overwritten. Trailing
    /// child pointers travel with their slots.
    fn copy_slot_range(
        &self,
        src: &Node<'t, K, V>,
        src_at: usize,
        dst_at: usize,
        amount: usize,
    ) -> Result<()> {
        self.tree.ensure_mutable()?;
        let layout = self.tree.layout();
        if src_at + amount > layout.max_pair_count || dst_at + amount > layout.max_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "slot move of {} elements exceeds the node capacity {}",
                amount, layout.max_pair_count
            )));
        }
        if amount == 0 {
            return Ok(());
        }

        let chunk_pairs = self.tree.max_move_pair_count();
        debug_assert!(chunk_pairs >= 1);
        let element = layout.element_size;
        let reverse = src.page == self.page && dst_at > src_at;
        let mut buf = vec![0u8; chunk_pairs.min(amount) * element];

        let mut done = 0;
        while done < amount {
            let n = chunk_pairs.min(amount - done);
            let at = if reverse { amount - done - n } else { done };
            let chunk = &mut buf[..n * element];
            src.read_exact(layout.slot_offset(src_at + at), chunk)?;
            self.write_exact(layout.slot_offset(dst_at + at), chunk)?;
            done += n;
        }
        Ok(())
    }

    /// Bulk-copy leaf pairs from `src` into this node
    pub(crate) fn copy_leaf_pairs(
        &self,
        src: &Node<'t, K, V>,
        src_at: usize,
        dst_at: usize,
        amount: usize,
    ) -> Result<()> {
        self.copy_slot_range(src, src_at, dst_at, amount)
    }

    /// Bulk-copy internal pairs from `src` into this node.
    ///
    /// Child pointers between the moved slots travel with them; the two
    /// pointers on the edges of the destination range must be supplied.
    pub(crate) fn copy_internal_pairs(
        &self,
        src: &Node<'t, K, V>,
        src_at: usize,
        dst_at: usize,
        amount: usize,
        leftmost_child: Option<PageIndex>,
        rightmost_child: Option<PageIndex>,
    ) -> Result<()> {
        self.copy_slot_range(src, src_at, dst_at, amount)?;
        self.set_child(dst_at, leftmost_child)?;
        self.set_child(dst_at + amount, rightmost_child)?;
        Ok(())
    }

    /// Insert a pair at slot `i` of a leaf, shifting later slots right
    pub(crate) fn insert_at_leaf(&self, i: usize, key: &K, value: &V) -> Result<()> {
        self.tree.ensure_mutable()?;
        if !self.is_leaf()? {
            return Err(TreeError::invalid_argument(
                "insert_at_leaf called on an internal node",
            ));
        }
        let count = self.pair_count()?;
        if count == self.tree.layout().max_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "leaf {} is full",
                self.page
            )));
        }
        if count == 0 {
            return Err(TreeError::invalid_argument(
                "insert into an empty node; the first pair of a tree is the root's to create",
            ));
        }
        if i > count {
            return Err(TreeError::invalid_argument(format!(
                "insert position {i} out of bounds ({count} pairs)"
            )));
        }

        self.set_pair_count(count + 1)?;
        self.copy_slot_range(self, i, i + 1, count - i)?;
        self.set_key(i, key)?;
        self.set_value(i, value)
    }

    /// Insert a pair at slot `i` of an internal node.
    ///
    /// `child` becomes the left or right child of the new key per `side`;
    /// the other side keeps the pointer previously at position `i` (the
    /// previous rightmost pointer when appending).
    pub(crate) fn insert_at_internal(
        &self,
        i: usize,
        key: &K,
        value: &V,
        child: Option<PageIndex>,
        side: ChildSide,
    ) -> Result<()> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? {
            return Err(TreeError::invalid_argument(
                "insert_at_internal called on a leaf",
            ));
        }
        let count = self.pair_count()?;
        if count == self.tree.layout().max_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "node {} is full",
                self.page
            )));
        }
        if i > count {
            return Err(TreeError::invalid_argument(format!(
                "insert position {i} out of bounds ({count} pairs)"
            )));
        }

        self.set_pair_count(count + 1)?;
        self.copy_slot_range(self, i, i + 1, count - i)?;
        self.set_key(i, key)?;
        self.set_value(i, value)?;
        match side {
            ChildSide::Right => self.set_child(i + 1, child),
            ChildSide::Left => {
                let displaced = self.child_index(i)?;
                self.set_child(i + 1, displaced)?;
                self.set_child(i, child)
            }
        }
    }

    /// Remove the pair at slot `i` of a leaf, shifting later slots left
    pub(crate) fn remove_at_leaf(&self, i: usize) -> Result<()> {
        self.tree.ensure_mutable()?;
        if !self.is_leaf()? {
            return Err(TreeError::invalid_argument(
                "remove_at_leaf called on an internal node",
            ));
        }
        let count = self.pair_count()?;
        self.check_slot(i)?;
        self.copy_slot_range(self, i + 1, i, count - 1 - i)?;
        self.set_pair_count(count - 1)
    }

    /// Remove the pair at slot `i` of an internal node, discarding the
    /// child pointer on the given side of the key; the other child stays
    /// at position `i`.
    pub(crate) fn remove_at_internal(&self, i: usize, discard: ChildSide) -> Result<()> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? {
            return Err(TreeError::invalid_argument(
                "remove_at_internal called on a leaf",
            ));
        }
        let count = self.pair_count()?;
        self.check_slot(i)?;

        // When the left pointer goes, the right one must survive at
        // position i; it lives in the slot the shift is about to
        // overwrite, so read it first.
        let kept = match discard {
            ChildSide::Left => Some(self.child_index(i + 1)?),
            ChildSide::Right => None,
        };
        self.copy_slot_range(self, i + 1, i, count - 1 - i)?;
        if let Some(kept) = kept {
            self.set_child(i, kept)?;
        }
        self.set_pair_count(count - 1)
    }

    /// Split the full child at position `i` into itself and the
    /// freshly-allocated `partner_page`, promoting the middle pair into
    /// this node with the partner as its right child.
    pub(crate) fn split_child(&self, i: usize, partner_page: PageIndex) -> Result<()> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? {
            return Err(TreeError::invalid_argument("split_child called on a leaf"));
        }
        let target = self
            .get_child(i)?
            .ok_or_else(|| TreeError::corruption(format!("node {} child {} is absent", self.page, i)))?;
        let layout = *self.tree.layout();
        if target.pair_count()? != layout.max_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "split target {} is not full",
                target.page
            )));
        }

        let leaf = target.is_leaf()?;
        let middle = layout.min_pair_count;
        let moved = layout.max_pair_count - middle - 1;

        let partner = Node::new(self.tree, partner_page);
        partner.init(leaf)?;
        partner.set_pair_count(moved)?;
        if leaf {
            partner.copy_leaf_pairs(&target, middle + 1, 0, moved)?;
        } else {
            let leftmost = target.child_index(middle + 1)?;
            let rightmost = target.child_index(layout.max_pair_count)?;
            partner.copy_internal_pairs(&target, middle + 1, 0, moved, leftmost, rightmost)?;
        }

        let middle_key = target.get_key(middle)?;
        let middle_value = target.get_value(middle)?;
        self.insert_at_internal(i, &middle_key, &middle_value, Some(partner_page), ChildSide::Right)?;
        target.set_pair_count(middle)
    }

    /// Move one pair from the left sibling through this node into the
    /// child at position `i`
    pub(crate) fn rotate_from_left(&self, i: usize) -> Result<()> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? || i == 0 {
            return Err(TreeError::invalid_argument(
                "rotate_from_left needs an internal parent and a left sibling",
            ));
        }
        let child = self
            .get_child(i)?
            .ok_or_else(|| TreeError::corruption(format!("node {} child {} is absent", self.page, i)))?;
        let left = self.get_child(i - 1)?.ok_or_else(|| {
            TreeError::corruption(format!("node {} child {} is absent", self.page, i - 1))
        })?;
        let left_count = left.pair_count()?;
        if left_count <= self.tree.layout().min_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "left sibling {} has no pair to spare",
                left.page
            )));
        }

        let parent_key = self.get_key(i - 1)?;
        let parent_value = self.get_value(i - 1)?;
        if child.is_leaf()? {
            child.insert_at_leaf(0, &parent_key, &parent_value)?;
        } else {
            let transferred = left.child_index(left_count)?;
            child.insert_at_internal(0, &parent_key, &parent_value, transferred, ChildSide::Left)?;
        }

        self.set_key(i - 1, &left.get_key(left_count - 1)?)?;
        self.set_value(i - 1, &left.get_value(left_count - 1)?)?;
        left.set_pair_count(left_count - 1)
    }

    /// Move one pair from the right sibling through this node into the
    /// child at position `i`
    pub(crate) fn rotate_from_right(&self, i: usize) -> Result<()> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? || i >= self.pair_count()? {
            return Err(TreeError::invalid_argument(
                "rotate_from_right needs an internal parent and a right sibling",
            ));
        }
        let child = self
            .get_child(i)?
            .ok_or_else(|| TreeError::corruption(format!("node {} child {} is absent", self.page, i)))?;
        let right = self.get_child(i + 1)?.ok_or_else(|| {
            TreeError::corruption(format!("node {} child {} is absent", self.page, i + 1))
        })?;
        let right_count = right.pair_count()?;
        if right_count <= self.tree.layout().min_pair_count {
            return Err(TreeError::invalid_argument(format!(
                "right sibling {} has no pair to spare",
                right.page
            )));
        }

        let child_count = child.pair_count()?;
        let parent_key = self.get_key(i)?;
        let parent_value = self.get_value(i)?;
        if child.is_leaf()? {
            child.insert_at_leaf(child_count, &parent_key, &parent_value)?;
        } else {
            let transferred = right.child_index(0)?;
            child.insert_at_internal(
                child_count,
                &parent_key,
                &parent_value,
                transferred,
                ChildSide::Right,
            )?;
        }

        self.set_key(i, &right.get_key(0)?)?;
        self.set_value(i, &right.get_value(0)?)?;
        if right.is_leaf()? {
            right.remove_at_leaf(0)
        } else {
            right.remove_at_internal(0, ChildSide::Left)
        }
    }

    /// Merge the children at positions `i` and `i + 1` around the pair at
    /// `i`, freeing the right child's page. Returns the merged node.
    pub(crate) fn merge_children(&self, i: usize) -> Result<Node<'t, K, V>> {
        self.tree.ensure_mutable()?;
        if self.is_leaf()? {
            return Err(TreeError::invalid_argument("merge_children called on a leaf"));
        }
        self.check_slot(i)?;
        let left = self
            .get_child(i)?
            .ok_or_else(|| TreeError::corruption(format!("node {} child {} is absent", self.page, i)))?;
        let right = self.get_child(i + 1)?.ok_or_else(|| {
            TreeError::corruption(format!("node {} child {} is absent", self.page, i + 1))
        })?;

        let separator_key = self.get_key(i)?;
        let separator_value = self.get_value(i)?;
        let left_count = left.pair_count()?;
        let right_count = right.pair_count()?;

        // Unlink the right child before touching it so a failure below
        // can only leak its page, never leave a dangling pointer.
        self.remove_at_internal(i, ChildSide::Right)?;

        if left.is_leaf()? {
            left.insert_at_leaf(left_count, &separator_key, &separator_value)?;
            left.set_pair_count(left_count + 1 + right_count)?;
            left.copy_leaf_pairs(&right, 0, left_count + 1, right_count)?;
        } else {
            let first = right.child_index(0)?;
            let last = right.child_index(right_count)?;
            left.insert_at_internal(
                left_count,
                &separator_key,
                &separator_value,
                first,
                ChildSide::Right,
            )?;
            left.set_pair_count(left_count + 1 + right_count)?;
            left.copy_internal_pairs(&right, 0, left_count + 1, right_count, first, last)?;
        }

        self.tree.storage().free_page(right.page.value())?;
        Ok(left)
    }

    /// Rightmost pair of the subtree rooted at this node
    pub(crate) fn last_pair_of_subtree(&self) -> Result<(K, V)> {
        let mut node = Node::new(self.tree, self.page);
        loop {
            let count = node.pair_count()?;
            if count == 0 {
                return Err(TreeError::corruption(format!(
                    "empty node {} on an extreme walk",
                    node.page
                )));
            }
            if node.is_leaf()? {
                return Ok((node.get_key(count - 1)?, node.get_value(count - 1)?));
            }
            node = node.get_child(count)?.ok_or_else(|| {
                TreeError::corruption(format!("node {} rightmost child is absent", node.page))
            })?;
        }
    }

    /// Leftmost pair of the subtree rooted at this node
    pub(crate) fn first_pair_of_subtree(&self) -> Result<(K, V)> {
        let mut node = Node::new(self.tree, self.page);
        loop {
            if node.pair_count()? == 0 {
                return Err(TreeError::corruption(format!(
                    "empty node {} on an extreme walk",
                    node.page
                )));
            }
            if node.is_leaf()? {
                return Ok((node.get_key(0)?, node.get_value(0)?));
            }
            node = node.get_child(0)?.ok_or_else(|| {
                TreeError::corruption(format!("node {} leftmost child is absent", node.page))
            })?;
        }
    }
}
