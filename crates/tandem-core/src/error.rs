use thiserror::Error;

/// Top-level error type for the Tandem pipeline.
///
/// Per-video failures never show up here: they are recorded on the
/// `VideoRecord` and counted in stage reports. Only conditions that abort a
/// whole run are represented, plus the ambient I/O and configuration errors.
/// Subsystem crates implement `From<SubsystemError> for TandemError` so the
/// `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TandemError {
    #[error("Transcript source blocked in this environment (at video {video_id}): {reason}")]
    EnvironmentBlocked { video_id: String, reason: String },

    #[error("Sync conflict: remote advanced on every attempt ({attempts} attempts)")]
    SyncConflict { attempts: u32 },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TandemError {
    /// Process exit status reported to the external scheduler.
    pub fn exit_code(&self) -> u8 {
        match self {
            TandemError::EnvironmentBlocked { .. } => 2,
            TandemError::SyncConflict { .. } => 3,
            TandemError::InvariantViolation(_) => 4,
            _ => 1,
        }
    }
}

impl From<toml::de::Error> for TandemError {
    fn from(err: toml::de::Error) -> Self {
        TandemError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TandemError {
    fn from(err: toml::ser::Error) -> Self {
        TandemError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tandem operations.
pub type Result<T> = std::result::Result<T, TandemError>;
