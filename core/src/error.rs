//! Structured error types for meshd
//!
//! Only genuinely user-visible failures get a `MeshError` variant. Stale
//! and transient conditions are never constructed as errors — callers that
//! hit those paths get a plain `bool`/`Option` instead, since those never
//! need to surface.

use std::net::SocketAddr;
use thiserror::Error;

/// Primary error type for meshd operations
#[derive(Error, Debug)]
pub enum MeshError {
    // =========================================================================
    // Size limit errors
    // =========================================================================
    /// Payload exceeded a configured size limit before it was ever broadcast
    #[error("{what} of {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    // =========================================================================
    // State errors
    // =========================================================================
    /// Operation not valid given the node's current lifecycle state
    #[error("invalid state: {operation} is not valid while the node is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    // =========================================================================
    // Input errors
    // =========================================================================
    /// Caller-supplied input was malformed or empty
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    // =========================================================================
    // Fatal errors (abort Create / force Shutdown)
    // =========================================================================
    /// Unable to bind the transport, open the snapshot file, or otherwise
    /// complete `Create`
    #[error("fatal: {message}")]
    Fatal { message: String },

    // =========================================================================
    // Remote errors
    // =========================================================================
    /// A peer replied with a structured error body
    #[error("remote error from {from}: {message}")]
    RemoteError { from: SocketAddr, message: String },

    // =========================================================================
    // External error wrappers (transparent)
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),
}

impl MeshError {
    /// True for the errors user-visible APIs must surface. `Io`/`Encode`/
    /// `Decode` are wrapped separately by the component that produced them
    /// (codec, snapshotter) and are not part of this policy check — they
    /// already propagate through `?`.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::SizeLimitExceeded { .. }
                | Self::InvalidState { .. }
                | Self::InvalidInput { .. }
                | Self::Fatal { .. }
                | Self::RemoteError { .. }
        )
    }
}

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type alias using MeshError
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit_is_user_visible() {
        let err = MeshError::SizeLimitExceeded {
            what: "user event payload",
            size: 600,
            limit: 512,
        };
        assert!(err.is_user_visible());
        assert!(err.to_string().contains("600"));
    }

    #[test]
    fn io_errors_are_not_flagged_user_visible() {
        let err: MeshError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(!err.is_user_visible());
    }

    #[test]
    fn invalid_state_message_names_the_state() {
        let err = MeshError::InvalidState {
            operation: "Join",
            state: "Shutdown",
        };
        assert!(err.to_string().contains("Join"));
        assert!(err.to_string().contains("Shutdown"));
    }
}
