//! Read-only structural access.
//!
//! A `TreeReader` is the one doorway through which external code may
//! touch nodes directly. Construction demands a read-only tree; with no
//! writer possible, readers need no coordination among themselves and may
//! be used from any number of threads.

use crate::btree::node::Node;
use crate::btree::tree::BTreeIndex;
use crate::error::{Result, TreeError};

/// Read-only façade over a frozen tree's node structure
pub struct TreeReader<'t, K, V> {
    tree: &'t BTreeIndex<K, V>,
}

impl<'t, K, V> TreeReader<'t, K, V> {
    /// Wrap a tree, failing unless it reports read-only
    pub fn new(tree: &'t BTreeIndex<K, V>) -> Result<Self> {
        if !tree.is_read_only() {
            return Err(TreeError::invalid_mode(
                "a reader requires a read-only tree",
            ));
        }
        Ok(Self { tree })
    }

    /// The tree under observation
    pub fn tree(&self) -> &'t BTreeIndex<K, V> {
        self.tree
    }

    /// Root node of the tree, or `None` when it is empty
    pub fn root_node(&self) -> Result<Option<Node<'t, K, V>>> {
        self.tree.root_node()
    }
}
