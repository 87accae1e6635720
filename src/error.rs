use thiserror::Error;

/// Crate-wide error type.
///
/// Backend errors are classified into `NotFound`, `Transient`, and `Fatal`
/// so callers can decide whether a retry is worthwhile without matching on
/// provider-specific details.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Fatal backend error: {0}")]
    Fatal(String),

    #[error("Write buffer full: {0}")]
    BufferFull(String),

    #[error("Non-contiguous write: {0}")]
    NonContiguous(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Corrupted cache payload: {0}")]
    Corrupted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Component closed: {0}")]
    Closed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Whether a retry of the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Transient(_) | FsError::Timeout(_))
    }
}

impl Clone for FsError {
    fn clone(&self) -> Self {
        match self {
            FsError::Io(e) => FsError::Internal(format!("IO error: {}", e)),
            FsError::NotFound(s) => FsError::NotFound(s.clone()),
            FsError::Transient(s) => FsError::Transient(s.clone()),
            FsError::Fatal(s) => FsError::Fatal(s.clone()),
            FsError::BufferFull(s) => FsError::BufferFull(s.clone()),
            FsError::NonContiguous(s) => FsError::NonContiguous(s.clone()),
            FsError::Cancelled(s) => FsError::Cancelled(s.clone()),
            FsError::Corrupted(s) => FsError::Corrupted(s.clone()),
            FsError::Timeout(s) => FsError::Timeout(s.clone()),
            FsError::Configuration(s) => FsError::Configuration(s.clone()),
            FsError::Serialization(s) => FsError::Serialization(s.clone()),
            FsError::Closed(s) => FsError::Closed(s.clone()),
            FsError::Internal(s) => FsError::Internal(s.clone()),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
