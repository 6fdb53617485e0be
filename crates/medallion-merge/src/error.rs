//! Error types for the dataset merger.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Convert any `Display` error into a `StorageFault` at the given path.
macro_rules! fault_at {
    ($path:expr) => {
        |e| $crate::error::MergeError::storage($path, e)
    };
}

/// Convert an Arrow compute error into `MergeError::Compute`.
macro_rules! compute_err {
    () => {
        |e| $crate::error::MergeError::Compute(e.to_string())
    };
}

pub(crate) use {compute_err, fault_at};

/// Result type alias for merge and dataset operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Errors that can occur while probing, reading, merging or writing a dataset.
///
/// "No data at this location" is not an error: it is reported as
/// [`Probe::Absent`](crate::location::Probe::Absent).
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("storage fault at {}: {message}", path.display())]
    StorageFault { path: PathBuf, message: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("invalid merge options: {0}")]
    InvalidOptions(String),

    #[error("source batch is empty")]
    EmptySource,

    #[error("source batch has a null value in key column '{0}'")]
    NullKey(String),

    #[error("source batch contains key {0} more than once")]
    DuplicateKey(String),

    #[error("arrow compute error: {0}")]
    Compute(String),
}

impl MergeError {
    pub(crate) fn storage(path: &Path, err: impl std::fmt::Display) -> Self {
        MergeError::StorageFault {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// True for errors raised by validation, before anything was written.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            MergeError::StorageFault { .. } | MergeError::Compute(_)
        )
    }
}
