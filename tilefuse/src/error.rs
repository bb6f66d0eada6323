//! Error types for tilefuse

use thiserror::Error;

/// Result type alias using tilefuse's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tilefuse operations
///
/// Configuration and workspace errors are raised on the host before anything
/// is enqueued. Device-side errors are captured by the stream that ran the
/// failing work and surface from its next `synchronize()`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("workspace too small: need {required} bytes, got {provided}")]
    WorkspaceTooSmall { required: usize, provided: usize },

    #[error("kernel rejected arguments: {0}")]
    KernelRejected(String),

    #[error("device failure: {0}")]
    DeviceFailure(String),

    #[error("flag wait timed out: slot {slot}, epoch {epoch} after {waited_ms}ms")]
    Timeout {
        slot: usize,
        epoch: u32,
        waited_ms: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidConfiguration`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether this error was detected on the host before any launch.
    #[must_use]
    pub fn is_host_side(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration(_)
                | Self::WorkspaceTooSmall { .. }
                | Self::KernelRejected(_)
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::WorkspaceTooSmall {
            required: 512,
            provided: 256,
        };
        assert_eq!(
            err.to_string(),
            "workspace too small: need 512 bytes, got 256"
        );
        assert_eq!(
            Error::invalid("sub_world_size 3 does not divide m 16").to_string(),
            "invalid configuration: sub_world_size 3 does not divide m 16"
        );
    }

    #[test]
    fn test_host_side_classification() {
        assert!(Error::invalid("x").is_host_side());
        assert!(Error::KernelRejected("x".into()).is_host_side());
        assert!(!Error::DeviceFailure("x".into()).is_host_side());
        assert!(!Error::Timeout {
            slot: 0,
            epoch: 1,
            waited_ms: 10
        }
        .is_host_side());
    }
}
