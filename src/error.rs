//! Error types for the index.

use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur while operating on the tree or its page storage.
///
/// Allocation refusal is deliberately not represented here: the page
/// storage reports it as `Ok(None)` and the tree surfaces it through the
/// `insert` outcome booleans, because it is a recoverable condition the
/// caller must inspect rather than an exceptional one.
#[derive(Error, Debug)]
pub enum TreeError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied values violate a documented precondition.
    /// Tree state is unchanged.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current tree mode (read-only tree,
    /// or a mutation attempted while a traversal is live). Tree state is
    /// unchanged.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// An on-page or structural invariant was observed broken. The tree
    /// must be considered untrusted from this point on.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl TreeError {
    /// Create an invalid-argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid-mode error with a message
    pub fn invalid_mode(msg: impl Into<String>) -> Self {
        Self::InvalidMode(msg.into())
    }

    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }
}
