//! File-backed page storage.
//!
//! One store per file: a checksummed header in the first `page_size`
//! bytes, then the pages themselves. Freed pages are remembered in memory
//! and reused before the file grows; the free set is not persisted, so a
//! reopened store treats previously freed pages as allocated until they
//! cycle through `free_page` again.

use crate::error::{Result, TreeError};
use crate::storage::file_header::ENCODED_HEADER_LEN;
use crate::storage::{FreePageSet, PageStorage, StoreFileHeader};
use crate::types::CancellationToken;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

struct Inner {
    file: File,
    header: StoreFileHeader,
    free: FreePageSet,
}

/// Page storage backed by a single file
pub struct FilePageStorage {
    page_size: usize,
    read_only: bool,
    inner: RwLock<Inner>,
}

impl FilePageStorage {
    /// Create a new store file with the given page size.
    ///
    /// Fails if the file already exists or if `page_size` cannot hold the
    /// store header.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        if page_size < ENCODED_HEADER_LEN {
            return Err(TreeError::invalid_argument(format!(
                "page size {page_size} cannot hold the {ENCODED_HEADER_LEN}-byte store header"
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = StoreFileHeader::new(page_size as u32);
        let storage = Self {
            page_size,
            read_only: false,
            inner: RwLock::new(Inner {
                file,
                header,
                free: FreePageSet::new(),
            }),
        };
        storage.flush_header(&mut storage.inner.write())?;
        Ok(storage)
    }

    /// Open an existing store file for reading and writing
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_mode(path, false)
    }

    /// Open an existing store file, refusing all mutation
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_with_mode(path, true)
    }

    fn open_with_mode(path: &Path, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let mut buf = [0u8; ENCODED_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = StoreFileHeader::read(&buf)?;

        Ok(Self {
            page_size: header.page_size as usize,
            read_only,
            inner: RwLock::new(Inner {
                file,
                header,
                free: FreePageSet::new(),
            }),
        })
    }

    fn flush_header(&self, inner: &mut Inner) -> Result<()> {
        let mut buf = vec![0u8; ENCODED_HEADER_LEN];
        inner.header.write(&mut buf);
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&buf)?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
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

    fn ensure_allocated(inner: &Inner, index: i64) -> Result<()> {
        if index < 0 || index >= inner.header.frontier || inner.free.contains(index) {
            return Err(TreeError::invalid_argument(format!(
                "page {index} is not allocated"
            )));
        }
        Ok(())
    }

    fn file_offset(&self, index: i64) -> u64 {
        (index as u64 + 1) * self.page_size as u64
    }

    /// Append one zeroed page to the file, growing the capacity
    fn append_page(&self, inner: &mut Inner) -> Result<()> {
        let index = inner.header.page_capacity;
        let zeros = vec![0u8; self.page_size];
        inner.file.seek(SeekFrom::Start(self.file_offset(index)))?;
        inner.file.write_all(&zeros)?;
        inner.header.page_capacity += 1;
        Ok(())
    }
}

impl PageStorage for FilePageStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_capacity(&self) -> i64 {
        self.inner.read().header.page_capacity
    }

    fn allocated_page_count(&self) -> i64 {
        let inner = self.inner.read();
        inner.header.frontier - inner.free.len() as i64
    }

    fn is_capacity_fixed(&self) -> bool {
        false
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_page_on_storage(&self, index: i64) -> bool {
        index >= 0 && index < self.inner.read().header.page_capacity
    }

    fn is_page_allocated(&self, index: i64) -> bool {
        Self::ensure_allocated(&self.inner.read(), index).is_ok()
    }

    fn read_from(&self, index: i64, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;

        // The write lock serializes access to the shared file cursor.
        let mut inner = self.inner.write();
        Self::ensure_allocated(&inner, index)?;
        let at = self.file_offset(index) + offset as u64;
        inner.file.seek(SeekFrom::Start(at))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    fn write_to(&self, index: i64, offset: usize, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.check_span(offset, buf.len())?;

        let mut inner = self.inner.write();
        Self::ensure_allocated(&inner, index)?;
        let at = self.file_offset(index) + offset as u64;
        inner.file.seek(SeekFrom::Start(at))?;
        inner.file.write_all(buf)?;
        Ok(())
    }

    fn try_allocate_page(&self) -> Result<Option<i64>> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        if let Some(index) = inner.free.take_lowest() {
            return Ok(Some(index));
        }
        if inner.header.frontier == inner.header.page_capacity {
            self.append_page(&mut inner)?;
        }

        let index = inner.header.frontier;
        inner.header.frontier += 1;
        self.flush_header(&mut inner)?;
        Ok(Some(index))
    }

    fn free_page(&self, index: i64) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        Self::ensure_allocated(&inner, index)?;
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

        let mut inner = self.inner.write();
        let mut added = 0;
        while added < additional {
            if cancel.is_cancelled() {
                break;
            }
            self.append_page(&mut inner)?;
            added += 1;
        }
        if added > 0 {
            self.flush_header(&mut inner)?;
        }
        Ok(added)
    }
}
