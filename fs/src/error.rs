//! Error types for the file backend.

use evtsm_core::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing state files.
///
/// Converted into [`StoreError`] at the trait boundary; the path is kept in
/// the message.
#[derive(Error, Debug)]
pub enum FileStoreError {
    /// Filesystem operation failed.
    #[error("{op} {}: {source}", path.display())]
    Io {
        /// What was being attempted.
        op: &'static str,
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A state file could not be encoded or decoded.
    #[error("{}: {source}", path.display())]
    Json {
        /// State file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl FileStoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

impl From<FileStoreError> for StoreError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Io { .. } => Self::Io(err.to_string()),
            FileStoreError::Json { .. } => Self::Serialization(err.to_string()),
        }
    }
}
