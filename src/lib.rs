//! # BTree Index
//!
//! A persistent B-tree index mapping fixed-width keys to fixed-width
//! values, with every node stored in exactly one page of an external
//! page-addressable store.
//!
//! ## Architecture
//!
//! The crate is composed of small, swappable layers:
//!
//! - **Codec Layer** (`codec`): fixed-width key/value serialization
//! - **Storage Layer** (`storage`): the page-store contract plus
//!   in-memory and single-file backends
//! - **B-Tree Layer** (`btree`): node records, tree algorithms,
//!   traversal, and the read-only reader
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_index::{BTreeIndex, CancellationToken, I64Codec, MemoryPageStorage, TreeOptions};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(MemoryPageStorage::new(4096));
//! let tree = BTreeIndex::new(
//!     storage,
//!     Box::new(I64Codec),
//!     Box::new(I64Codec),
//!     TreeOptions::default(),
//! )?;
//!
//! tree.insert(&1, &100, true)?;
//! let cancel = CancellationToken::new();
//! assert_eq!(tree.try_get_value(&1, &cancel)?, Some(100));
//!
//! for pair in tree.traverse(true)? {
//!     let (key, value) = pair?;
//!     println!("{key} -> {value}");
//! }
//!
//! tree.remove(&1)?;
//! ```

pub mod btree;
pub mod codec;
pub mod error;
pub mod storage;
pub mod types;

pub use error::{Result, TreeError};
pub use types::{CancellationToken, PageIndex, TreeHeader, TreeOptions};

// Re-export main public API
pub use btree::{
    required_page_size, BTreeIndex, InsertOutcome, Node, NodeLayout, Traversal, TreeReader,
};
pub use codec::{FixedBytesCodec, FixedSizeCodec, I64Codec, KeyCodec, U64Codec, UnitCodec};
pub use storage::{FilePageStorage, MemoryPageStorage, PageStorage};
