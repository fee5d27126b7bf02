//! Store file header.
//!
//! The first `page_size` bytes of a store file hold metadata about the
//! store; logical page `i` follows at offset `(i + 1) * page_size`.

use crate::error::{Result, TreeError};

/// Magic bytes identifying a valid store file
pub const MAGIC: &[u8; 16] = b"BTreeIndexPS_v1\0";

/// Bytes covered by the checksum
const CHECKSUMMED_LEN: usize = 36;

/// Total encoded header length, checksum included
pub const ENCODED_HEADER_LEN: usize = CHECKSUMMED_LEN + 4;

/// Metadata stored at the front of a store file
///
/// Layout (all integers little-endian):
/// ```text
/// offset  size  field
/// 0       16    magic
/// 16      4     page size in bytes
/// 20      8     page capacity (pages on storage)
/// 28      8     allocation frontier (first never-allocated index)
/// 36      4     CRC32 of bytes [0, 36)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFileHeader {
    /// Size of every page in the store
    pub page_size: u32,
    /// Number of pages on storage
    pub page_capacity: i64,
    /// First page index that has never been allocated
    pub frontier: i64,
}

impl StoreFileHeader {
    /// Header of a freshly created, empty store
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            page_capacity: 0,
            frontier: 0,
        }
    }

    /// Decode and verify a header
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_HEADER_LEN {
            return Err(TreeError::corruption("store header too short"));
        }
        if &bytes[0..16] != MAGIC {
            return Err(TreeError::corruption("bad store magic"));
        }

        let stored_checksum = u32::from_le_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]);
        let computed_checksum = crc32fast::hash(&bytes[0..CHECKSUMMED_LEN]);
        if stored_checksum != computed_checksum {
            return Err(TreeError::corruption("store header checksum mismatch"));
        }

        let page_size = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[20..28]);
        let page_capacity = i64::from_le_bytes(buf);
        buf.copy_from_slice(&bytes[28..36]);
        let frontier = i64::from_le_bytes(buf);

        if page_capacity < 0 || frontier < 0 || frontier > page_capacity {
            return Err(TreeError::corruption(format!(
                "implausible store header: capacity {page_capacity}, frontier {frontier}"
            )));
        }

        Ok(Self {
            page_size,
            page_capacity,
            frontier,
        })
    }

    /// Encode this header, checksum included
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..ENCODED_HEADER_LEN].fill(0);
        bytes[0..16].copy_from_slice(MAGIC);
        bytes[16..20].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.page_capacity.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.frontier.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[0..CHECKSUMMED_LEN]);
        bytes[36..40].copy_from_slice(&checksum.to_le_bytes());
    }
}
