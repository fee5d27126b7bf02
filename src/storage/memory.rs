//! In-memory page storage.
//!
//! Backs the tree with plain heap buffers. Besides being a usable backend
//! in its own right, this is the store the tests drive: a fixed capacity
//! makes allocation refusal deterministic, and the read-only switch lets a
//! tree be frozen for reader tests.

use crate::error::{Result, TreeError};
use crate::storage::{FreePageSet, PageStorage};
use crate::types::CancellationToken;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

struct Inner {
    /// Every page on storage, allocated or not
    pages: Vec<Box<[u8]>>,
    /// First index that has never been allocated
    frontier: usize,
    /// Pages allocated once and since freed
    free: FreePageSet,
}

/// Heap-backed page storage
pub struct MemoryPageStorage {
    page_size: usize,
    capacity_fixed: bool,
    read_only: AtomicBool,
    inner: RwLock<Inner>,
}

impl MemoryPageStorage {
    /// Create an empty, growable store
    pub fn new(page_size: usize) -> Self {
        Self::build(page_size, 0, false)
    }

    /// Create a growable store with `initial_pages` already on storage
    pub fn with_capacity(page_size: usize, initial_pages: usize) -> Self {
        Self::build(page_size, initial_pages, false)
    }

    /// Create a store whose capacity can never change
    pub fn with_fixed_capacity(page_size: usize, capacity: usize) -> Self {
        Self::build(page_size, capacity, true)
    }

    fn build(page_size: usize, initial_pages: usize, capacity_fixed: bool) -> Self {
        let pages = (0..initial_pages)
            .map(|_| vec![0u8; page_size].into_boxed_slice())
            .collect();

        Self {
            page_size,
            capacity_fixed,
            read_only: AtomicBool::new(false),
            inner: RwLock::new(Inner {
                pages,
                frontier: 0,
                free: FreePageSet::new(),
            }),
        }
    }

    /// Switch the store in or out of read-only mode
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TreeError::invalid_mode("page storage is read-only"));
        }
        Ok(())
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.page_size {
            return Err(TreeError::invalid_argument(format!(
                "byte range [{}, {}) exceeds page size {}",
                offset,
                offset + len,
                self.page_size
            )));
        }
        Ok(())
    }

    fn allocated_index(inner: &Inner, index: i64) -> Result<usize> {
        let i = usize::try_from(index)
            .map_err(|_| TreeError::invalid_argument(format!("negative page index {index}")))?;
        if i >= inner.frontier || inner.free.contains(index) {
            return Err(TreeError::invalid_argument(format!(
                "page {index} is not allocated"
            )));
        }
        Ok(i)
    }
}

impl PageStorage for MemoryPageStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_capacity(&self) -> i64 {
        self.inner.read().pages.len() as i64
    }

    fn allocated_page_count(&self) -> i64 {
        let inner = self.inner.read();
        (inner.frontier - inner.free.len()) as i64
    }

    fn is_capacity_fixed(&self) -> bool {
        self.capacity_fixed
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn is_page_on_storage(&self, index: i64) -> bool {
        index >= 0 && (index as usize) < self.inner.read().pages.len()
    }

    fn is_page_allocated(&self, index: i64) -> bool {
        let inner = self.inner.read();
        Self::allocated_index(&inner, index).is_ok()
    }

    fn read_from(&self, index: i64, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        let inner = self.inner.read();
        let i = Self::allocated_index(&inner, index)?;
        buf.copy_from_slice(&inner.pages[i][offset..offset + buf.len()]);
        Ok(())
    }

    fn write_to(&self, index: i64, offset: usize, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.check_span(offset, buf.len())?;
        let mut inner = self.inner.write();
        let i = Self::allocated_index(&inner, index)?;
        inner.pages[i][offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn try_allocate_page(&self) -> Result<Option<i64>> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        if let Some(index) = inner.free.take_lowest() {
            return Ok(Some(index));
        }
        if inner.frontier < inner.pages.len() {
            let index = inner.frontier;
            inner.frontier += 1;
            return Ok(Some(index as i64));
        }
        if self.capacity_fixed {
            return Ok(None);
        }

        let page = vec![0u8; self.page_size].into_boxed_slice();
        inner.pages.push(page);
        let index = inner.frontier;
        inner.frontier += 1;
        Ok(Some(index as i64))
    }

    fn free_page(&self, index: i64) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        Self::allocated_index(&inner, index)?;
        inner.free.insert(index);
        Ok(())
    }

    fn try_inflate(&self, additional: i64, cancel: &CancellationToken) -> Result<i64> {
        self.ensure_writable()?;
        if additional < 0 {
            return Err(TreeError::invalid_argument(format!(
                "cannot inflate by {additional} pages"
            )));
        }
        if self.capacity_fixed {
            return Ok(0);
        }

        let mut added = 0;
        while added < additional {
            if cancel.is_cancelled() {
                break;
            }
            let page = vec![0u8; self.page_size].into_boxed_slice();
            self.inner.write().pages.push(page);
            added += 1;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read() {
        let storage = MemoryPageStorage::new(64);
        assert_eq!(storage.page_capacity(), 0);

        let page = storage.try_allocate_page().unwrap().unwrap();
        assert_eq!(page, 0);
        assert!(storage.is_page_allocated(page));
        assert_eq!(storage.allocated_page_count(), 1);

        storage.write_to(page, 10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        storage.read_from(page, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_free_and_reuse() {
        let storage = MemoryPageStorage::new(64);
        let p0 = storage.try_allocate_page().unwrap().unwrap();
        let p1 = storage.try_allocate_page().unwrap().unwrap();
        let _p2 = storage.try_allocate_page().unwrap().unwrap();

        storage.free_page(p1).unwrap();
        assert!(!storage.is_page_allocated(p1));
        assert!(storage.is_page_on_storage(p1));
        assert_eq!(storage.allocated_page_count(), 2);

        // Lowest freed index comes back first
        assert_eq!(storage.try_allocate_page().unwrap(), Some(p1));
        assert!(storage.is_page_allocated(p0));
    }

    #[test]
    fn test_fixed_capacity_refuses() {
        let storage = MemoryPageStorage::with_fixed_capacity(64, 2);
        assert!(storage.is_capacity_fixed());

        assert!(storage.try_allocate_page().unwrap().is_some());
        assert!(storage.try_allocate_page().unwrap().is_some());
        assert_eq!(storage.try_allocate_page().unwrap(), None);

        let cancel = CancellationToken::new();
        assert_eq!(storage.try_inflate(4, &cancel).unwrap(), 0);
    }

    #[test]
    fn test_read_only_guards() {
        let storage = MemoryPageStorage::new(64);
        let page = storage.try_allocate_page().unwrap().unwrap();
        storage.write_to(page, 0, b"x").unwrap();

        storage.set_read_only(true);
        assert!(storage.is_read_only());
        assert!(matches!(
            storage.write_to(page, 0, b"y"),
            Err(TreeError::InvalidMode(_))
        ));
        assert!(matches!(
            storage.try_allocate_page(),
            Err(TreeError::InvalidMode(_))
        ));
        assert!(matches!(
            storage.free_page(page),
            Err(TreeError::InvalidMode(_))
        ));

        // Reads keep working
        let mut buf = [0u8; 1];
        storage.read_from(page, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_inflate_and_cancel() {
        let storage = MemoryPageStorage::new(64);
        let cancel = CancellationToken::new();

        assert_eq!(storage.try_inflate(3, &cancel).unwrap(), 3);
        assert_eq!(storage.page_capacity(), 3);
        assert_eq!(storage.allocated_page_count(), 0);

        cancel.cancel();
        assert_eq!(storage.try_inflate(3, &cancel).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_access() {
        let storage = MemoryPageStorage::new(16);
        let page = storage.try_allocate_page().unwrap().unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            storage.read_from(page, 12, &mut buf),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.read_from(7, 0, &mut buf),
            Err(TreeError::InvalidArgument(_))
        ));
    }
}
