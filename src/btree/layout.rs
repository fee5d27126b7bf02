//! Node geometry.
//!
//! A node occupies exactly one page: a 17-byte header followed by
//! fixed-width element slots. All sizes are derived once at tree
//! construction from the page size and the codec widths.
//!
//! ```text
//! offset  size  field
//! 0       8     key_value_pair_count  (signed 64-bit, little-endian)
//! 8       1     is_leaf               (0x00 = internal, 0xFF = leaf)
//! 9       8     child_page_index[0]   (signed 64-bit, -1 = none)
//! 17      ...   slots: [ key | value | right_child_page_index (8) ]
//! ```

use crate::error::{Result, TreeError};

/// Byte offset of the pair-count header field
pub(crate) const PAIR_COUNT_OFFSET: usize = 0;

/// Byte offset of the leaf flag
pub(crate) const IS_LEAF_OFFSET: usize = 8;

/// Byte offset of child pointer 0
pub(crate) const FIRST_CHILD_OFFSET: usize = 9;

/// Total node header size in bytes
pub const NODE_HEADER_SIZE: usize = 17;

/// Width of a child pointer within a slot
pub(crate) const CHILD_POINTER_SIZE: usize = 8;

/// Smallest per-node capacity the tree accepts
pub const VERY_MIN_PAIR_COUNT: usize = 5;

/// Derived geometry of a node for one tree instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    /// Encoded key width in bytes
    pub key_size: usize,
    /// Encoded value width in bytes
    pub value_size: usize,
    /// Full slot width: key + value + child pointer
    pub element_size: usize,
    /// Page size the geometry was computed for
    pub page_size: usize,
    /// Largest number of pairs a node can hold (always odd)
    pub max_pair_count: usize,
    /// Smallest number of pairs a non-root node may hold
    pub min_pair_count: usize,
}

impl NodeLayout {
    /// Compute the geometry for a page size, or reject pages too small to
    /// hold [`VERY_MIN_PAIR_COUNT`] elements.
    pub fn new(key_size: usize, value_size: usize, page_size: usize) -> Result<Self> {
        if key_size == 0 {
            return Err(TreeError::invalid_argument(
                "key codec must encode at least one byte",
            ));
        }

        let element_size = key_size + value_size + CHILD_POINTER_SIZE;
        let required = required_page_size(key_size, value_size, VERY_MIN_PAIR_COUNT);
        if page_size < required {
            return Err(TreeError::invalid_argument(format!(
                "page size {page_size} is below the required minimum {required}"
            )));
        }

        let mut max_pair_count = (page_size - NODE_HEADER_SIZE) / element_size;
        // An odd capacity makes both split halves land exactly on the
        // per-node minimum.
        if max_pair_count % 2 == 0 {
            max_pair_count -= 1;
        }

        Ok(Self {
            key_size,
            value_size,
            element_size,
            page_size,
            max_pair_count,
            min_pair_count: max_pair_count / 2,
        })
    }

    /// Byte offset of slot `i`
    pub(crate) fn slot_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE + i * self.element_size
    }

    /// Byte offset of the key in slot `i`
    pub(crate) fn key_offset(&self, i: usize) -> usize {
        self.slot_offset(i)
    }

    /// Byte offset of the value in slot `i`
    pub(crate) fn value_offset(&self, i: usize) -> usize {
        self.slot_offset(i) + self.key_size
    }

    /// Byte offset of child pointer `i`.
    ///
    /// Pointer 0 lives in the header; pointer `i + 1` is the trailing
    /// bytes of slot `i`.
    pub(crate) fn child_offset(&self, i: usize) -> usize {
        if i == 0 {
            FIRST_CHILD_OFFSET
        } else {
            self.slot_offset(i - 1) + self.key_size + self.value_size
        }
    }
}

/// Smallest page size able to hold `pair_capacity` elements
pub fn required_page_size(key_size: usize, value_size: usize, pair_capacity: usize) -> usize {
    NODE_HEADER_SIZE + (key_size + value_size + CHILD_POINTER_SIZE) * pair_capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_page_size() {
        // 8-byte keys and values: 17 + 24 * 5
        assert_eq!(required_page_size(8, 8, 5), 137);
        assert_eq!(required_page_size(4, 0, 5), 77);
    }

    #[test]
    fn test_capacity_is_odd() {
        // 137 bytes fit exactly 5 elements of 24 bytes
        let layout = NodeLayout::new(8, 8, 137).unwrap();
        assert_eq!(layout.max_pair_count, 5);
        assert_eq!(layout.min_pair_count, 2);

        // 6 elements fit, but even capacities round down to 5
        let layout = NodeLayout::new(8, 8, 137 + 24).unwrap();
        assert_eq!(layout.max_pair_count, 5);

        // 7 elements stay at 7
        let layout = NodeLayout::new(8, 8, 137 + 48).unwrap();
        assert_eq!(layout.max_pair_count, 7);
        assert_eq!(layout.min_pair_count, 3);
    }

    #[test]
    fn test_too_small_page_rejected() {
        assert!(matches!(
            NodeLayout::new(8, 8, 136),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            NodeLayout::new(0, 8, 4096),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_offsets() {
        let layout = NodeLayout::new(8, 8, 137).unwrap();
        assert_eq!(layout.slot_offset(0), 17);
        assert_eq!(layout.key_offset(1), 17 + 24);
        assert_eq!(layout.value_offset(0), 25);
        assert_eq!(layout.child_offset(0), 9);
        assert_eq!(layout.child_offset(1), 33);
        assert_eq!(layout.child_offset(2), 57);
    }

    #[test]
    fn test_max_exceeds_twice_min() {
        for page_size in [137, 200, 4096, 65536] {
            let layout = NodeLayout::new(8, 8, page_size).unwrap();
            assert_eq!(layout.max_pair_count % 2, 1);
            assert!(layout.max_pair_count > 2 * layout.min_pair_count);
        }
    }
}
