use std::sync::Arc;
use thiserror::Error;

/// Failures surfaced by the cache coordinator and its collaborators.
///
/// The type is `Clone` because a single negotiation failure is delivered to
/// every waiter, and a terminal download failure to every pending reader.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Server responded with status {status}")]
    ServerError { status: u16 },

    #[error("Size mismatch: expected {expected} bytes, cache holds {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Cache file too small: minimum {minimum} bytes, cache holds {actual}")]
    BelowMinimumSize { minimum: u64, actual: u64 },

    #[error("Unexpected partial content: expected range start {expected}, server sent {actual}")]
    UnexpectedRangeStart { expected: u64, actual: i64 },

    #[error("Insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Coordinator is shut down")]
    Closed,
}

impl CacheError {
    /// Whether the failure may be retried within a retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ServerError { .. } | Self::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map an I/O error, classifying disk exhaustion separately
    pub fn from_io(err: std::io::Error, required: u64) -> Self {
        if is_disk_full_error(&err) {
            Self::InsufficientDiskSpace {
                required,
                available: 0,
            }
        } else {
            Self::Io(Arc::new(err))
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, 0)
    }
}

/// Check if an I/O error is due to disk space exhaustion (ENOSPC)
pub fn is_disk_full_error(err: &std::io::Error) -> bool {
    if matches!(err.kind(), std::io::ErrorKind::StorageFull) {
        return true;
    }

    // 28 = ENOSPC on Unix
    #[cfg(unix)]
    if err.raw_os_error() == Some(28) {
        return true;
    }

    // ERROR_DISK_FULL
    #[cfg(windows)]
    if err.raw_os_error() == Some(112) {
        return true;
    }

    let error_msg = err.to_string().to_lowercase();
    error_msg.contains("no space left")
        || error_msg.contains("disk full")
        || error_msg.contains("out of space")
}

pub type CacheResult<T> = Result<T, CacheError>;
