//! Error types for shmview

use std::io;
use thiserror::Error;

use crate::shm::SegmentId;

/// Result type for shmview operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors that can occur while attaching to or accessing shared memory
#[derive(Debug, Error)]
pub enum ShmError {
    /// The named segment does not exist or could not be mapped
    #[error("Failed to attach to shm_id {id}: {source}")]
    Attach {
        id: SegmentId,
        #[source]
        source: io::Error,
    },

    /// A view or an access inside a view falls outside its bounds
    #[error("Range out of bounds: offset {offset} + len {len} exceeds {bound} bytes")]
    Range { offset: usize, len: usize, bound: usize },

    /// An application-level marker check failed
    #[error("Validation failed for {field}: expected 0x{expected:X}, got 0x{got:X}")]
    Validation {
        field: &'static str,
        expected: u64,
        got: u64,
    },

    /// The request carried no shared memory locator
    #[error("Request has no shared memory locator")]
    MissingLocator,

    /// Executor configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be started
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// The executor no longer accepts requests
    #[error("Executor has shut down")]
    Shutdown,
}

impl ShmError {
    pub(crate) fn attach(id: SegmentId, source: impl Into<io::Error>) -> Self {
        ShmError::Attach {
            id,
            source: source.into(),
        }
    }

    /// Whether this failure belongs to a single request and should be
    /// reported back to the caller rather than treated as fatal.
    pub fn is_request_error(&self) -> bool {
        !matches!(self, ShmError::InvalidConfig(_) | ShmError::Spawn(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = ShmError::Range {
            offset: 8,
            len: 16,
            bound: 20,
        };
        assert_eq!(
            err.to_string(),
            "Range out of bounds: offset 8 + len 16 exceeds 20 bytes"
        );

        let err = ShmError::Validation {
            field: "marker",
            expected: 0xDEADBEEF,
            got: 42,
        };
        assert_eq!(
            err.to_string(),
            "Validation failed for marker: expected 0xDEADBEEF, got 0x2A"
        );
    }

    #[test]
    fn test_request_scope() {
        assert!(ShmError::MissingLocator.is_request_error());
        assert!(ShmError::attach(3, io::ErrorKind::NotFound).is_request_error());
        assert!(ShmError::Shutdown.is_request_error());
        assert!(!ShmError::InvalidConfig("threads".into()).is_request_error());
        assert!(!ShmError::Spawn(io::ErrorKind::WouldBlock.into()).is_request_error());
    }
}
