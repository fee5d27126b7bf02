//! Common types used throughout the index.

mod page_index;

pub use page_index::{PageIndex, NO_PAGE};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default chunk size for bulk element moves, in key/value pairs
pub const DEFAULT_MAX_MOVE_PAIR_COUNT: usize = 64;

/// Construction knobs for a tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeOptions {
    /// Maximum number of key/value pairs moved per chunk during bulk
    /// element moves (split, merge, slot shifting). Must be at least 1.
    pub max_move_pair_count: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_move_pair_count: DEFAULT_MAX_MOVE_PAIR_COUNT,
        }
    }
}

impl TreeOptions {
    /// Create options with a custom move-buffer bound
    pub fn new(max_move_pair_count: usize) -> Self {
        Self {
            max_move_pair_count,
        }
    }
}

/// Persistent attributes of a tree, stored externally by the host.
///
/// The page storage holds only node pages; where the root lives and how
/// many pairs the tree contains is the host's to persist (the serde derives
/// are there for exactly that). A tree is reopened by handing the header
/// back to [`crate::BTreeIndex::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeHeader {
    /// Page holding the root node, or `None` for an empty tree
    pub root_page_index: Option<PageIndex>,
    /// Total number of key/value pairs reachable from the root
    pub pair_count: i64,
}

impl TreeHeader {
    /// Header of an empty tree
    pub fn empty() -> Self {
        Self {
            root_page_index: None,
            pair_count: 0,
        }
    }
}

impl Default for TreeHeader {
    fn default() -> Self {
        Self::empty()
    }
}

/// Advisory cancellation flag for read-path operations.
///
/// Search and validation poll the token between per-node steps; a
/// cancelled search reports "not found" rather than a partial result.
/// Mutations do not honor cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
