//! Error types for the catalog.

use tandem_core::types::{Stage, VideoId};
use tandem_core::TandemError;

/// Errors from catalog reads, transitions and snapshot validation.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Video not found: {0}")]
    NotFound(VideoId),
    #[error("Invalid {stage} transition: {from} -> {to}")]
    InvalidTransition {
        stage: Stage,
        from: String,
        to: String,
    },
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Invalid video id: {0}")]
    InvalidId(String),
    #[error("Cannot requeue {id} for {stage}: {reason}")]
    InvalidRequeue {
        id: VideoId,
        stage: Stage,
        reason: String,
    },
}

impl From<CatalogError> for TandemError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InvalidTransition { .. } => {
                TandemError::InvariantViolation(err.to_string())
            }
            CatalogError::InvariantViolation(msg) => TandemError::InvariantViolation(msg),
            CatalogError::NotFound(_)
            | CatalogError::InvalidId(_)
            | CatalogError::InvalidRequeue { .. } => TandemError::InvalidInput(err.to_string()),
        }
    }
}
