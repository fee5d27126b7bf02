//! Storage layer: fixed-size page stores.
//!
//! The tree keeps all structural data in an external page storage: a
//! block-device-like array of fixed-size pages addressed by index. This
//! module defines the contract and two backends: an in-memory store (also
//! the test workhorse) and a single-file store.

mod file;
mod file_header;
mod freelist;
mod memory;

pub use file::FilePageStorage;
pub use file_header::StoreFileHeader;
pub use freelist::FreePageSet;
pub use memory::MemoryPageStorage;

use crate::error::Result;
use crate::types::CancellationToken;

/// A fixed-size page-addressable store.
///
/// Implementations must be safe for the single-writer/many-reader pattern
/// the tree uses: one mutating session at a time, any number of readers on
/// a read-only store.
pub trait PageStorage: Send + Sync {
    /// Size of every page, in bytes
    fn page_size(&self) -> usize;

    /// Number of pages currently on storage (allocated or not)
    fn page_capacity(&self) -> i64;

    /// Number of currently allocated pages
    fn allocated_page_count(&self) -> i64;

    /// Whether the capacity can never grow
    fn is_capacity_fixed(&self) -> bool;

    /// Whether the store refuses all mutation
    fn is_read_only(&self) -> bool;

    /// Whether `index` addresses a page that exists on storage
    fn is_page_on_storage(&self, index: i64) -> bool;

    /// Whether `index` addresses a currently allocated page
    fn is_page_allocated(&self, index: i64) -> bool;

    /// Read `buf.len()` bytes from an allocated page, starting at `offset`
    fn read_from(&self, index: i64, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len()` bytes to an allocated page, starting at `offset`
    fn write_to(&self, index: i64, offset: usize, buf: &[u8]) -> Result<()>;

    /// Allocate a page, or report a recoverable refusal with `Ok(None)`
    /// (capacity exhausted on a fixed store, for example)
    fn try_allocate_page(&self) -> Result<Option<i64>>;

    /// Free an allocated page for later reuse
    fn free_page(&self, index: i64) -> Result<()>;

    /// Grow the store by up to `additional` zeroed, unallocated pages.
    ///
    /// Returns the number of pages actually added, which may be less than
    /// requested on a fixed-capacity store or when cancelled mid-way.
    fn try_inflate(&self, additional: i64, cancel: &CancellationToken) -> Result<i64>;
}
