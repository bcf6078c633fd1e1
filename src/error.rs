//! Error types for sortmerge.
//!
//! All fallible operations in the crate return [`SortMergeError`] through the
//! [`Result`] alias. Reader corruption, merge failure and writer misuse each
//! have a dedicated variant so callers can tell them apart from ordinary
//! I/O problems.
//!
//! # Examples
//!
//! ```
//! use sortmerge::error::{Result, SortMergeError};
//!
//! fn check(capacity: usize) -> Result<()> {
//!     if capacity == 0 {
//!         return Err(SortMergeError::InvalidCapacity(capacity));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(0).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for sortmerge operations.
#[derive(Error, Debug)]
pub enum SortMergeError {
    /// I/O errors (file operations, pipes, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A segment writer was configured with a capacity of zero.
    #[error("Invalid capacity: {0} (capacity must be at least 1)")]
    InvalidCapacity(usize),

    /// A run could not be decoded. Never reported as plain exhaustion.
    #[error("Corrupt segment {run}: {reason}")]
    CorruptSegment { run: String, reason: String },

    /// A merge aborted because one of its input runs failed.
    #[error("Merge failed on run {run}: {source}")]
    MergeFailed {
        run: String,
        #[source]
        source: Box<SortMergeError>,
    },

    /// Programmer error: a writer was used after it was finalized.
    #[error("Writer misuse: {0}")]
    WriterMisuse(String),

    /// Invalid argument or configuration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with SortMergeError.
pub type Result<T> = std::result::Result<T, SortMergeError>;

impl SortMergeError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SortMergeError::Storage(msg.into())
    }

    /// Create a new corrupt segment error for the named run.
    pub fn corrupt<R: Into<String>, S: Into<String>>(run: R, reason: S) -> Self {
        SortMergeError::CorruptSegment {
            run: run.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an error raised while merging the named run.
    pub fn merge_failed<R: Into<String>>(run: R, source: SortMergeError) -> Self {
        SortMergeError::MergeFailed {
            run: run.into(),
            source: Box::new(source),
        }
    }

    /// Create a new writer misuse error.
    pub fn misuse<S: Into<String>>(msg: S) -> Self {
        SortMergeError::WriterMisuse(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SortMergeError::InvalidArgument(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        SortMergeError::OperationCancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        SortMergeError::Other(msg.into())
    }

    /// Whether this error (or the error it wraps) is a segment corruption.
    pub fn is_corruption(&self) -> bool {
        match self {
            SortMergeError::CorruptSegment { .. } => true,
            SortMergeError::MergeFailed { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}
