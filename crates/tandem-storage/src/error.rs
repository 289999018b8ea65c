//! Error types for the versioned store backends.

use tandem_core::TandemError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt store layout: {0}")]
    Corrupt(String),
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("Store lock unavailable: {0}")]
    Lock(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<StorageError> for TandemError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => TandemError::Io(e),
            StorageError::Serialization(e) => TandemError::Serialization(e.to_string()),
            other => TandemError::Storage(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Join(err.to_string())
    }
}
