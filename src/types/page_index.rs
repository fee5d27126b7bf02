//! Page index type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a page within a page storage.
///
/// Page indices are 0-based and signed 64-bit on disk; the raw value `-1`
/// encodes "no page" in child-pointer fields, which the in-memory API
/// represents as `Option<PageIndex>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageIndex(pub i64);

/// Raw on-disk encoding of "no page"
pub const NO_PAGE: i64 = -1;

impl PageIndex {
    /// Create a new page index
    pub const fn new(index: i64) -> Self {
        Self(index)
    }

    /// Get the raw index value
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Encode an optional page index into its raw on-disk form
    pub const fn encode_opt(index: Option<PageIndex>) -> i64 {
        match index {
            Some(p) => p.0,
            None => NO_PAGE,
        }
    }

    /// Decode a raw on-disk value.
    ///
    /// `-1` decodes to `None`; any other negative value is not a valid
    /// encoding and decodes to `Err` so the caller can report corruption
    /// with its own context.
    pub fn decode_opt(raw: i64) -> std::result::Result<Option<PageIndex>, i64> {
        match raw {
            NO_PAGE => Ok(None),
            r if r < NO_PAGE => Err(r),
            r => Ok(Some(PageIndex(r))),
        }
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PageIndex {
    fn from(index: i64) -> Self {
        Self(index)
    }
}

impl From<PageIndex> for i64 {
    fn from(index: PageIndex) -> Self {
        index.0
    }
}
