//! B-tree layer: node records, tree algorithms, traversal, and the
//! read-only reader.

mod iter;
mod layout;
mod node;
mod reader;
mod tree;

pub use iter::Traversal;
pub use layout::{required_page_size, NodeLayout, NODE_HEADER_SIZE, VERY_MIN_PAIR_COUNT};
pub use node::Node;
pub use reader::TreeReader;
pub use tree::{BTreeIndex, InsertOutcome};
