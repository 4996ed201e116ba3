use thiserror::Error;

use crate::types::{NodeId, StatusCode};

/// Top-level error type for the `cellink-api` crate.
///
/// Covers every failure a tag backend can report: session state,
/// service-level status codes, and transport breakage. `cellink-core`
/// maps these into phase-tagged field errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Session ─────────────────────────────────────────────────────
    /// No session is open on the backend.
    #[error("Client is not connected")]
    NotConnected,

    /// A service call completed with a non-good status code.
    #[error("{operation} failed: {status}")]
    Status {
        operation: &'static str,
        status: StatusCode,
    },

    /// The server does not know the requested node.
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    // ── Transport ───────────────────────────────────────────────────
    /// Socket or channel failure below the service layer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request did not complete in time.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Endpoint URL could not be built or parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::Status { status, .. } => status.is_uncertain() || *status == StatusCode::BAD_TIMEOUT,
            Self::NotConnected | Self::UnknownNode(_) | Self::InvalidUrl(_) => false,
        }
    }

    /// The status code carried by this error, if it came from the service layer.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::UnknownNode(_) => Some(StatusCode::BAD_NODE_ID_UNKNOWN),
            Self::NotConnected => Some(StatusCode::BAD_NOT_CONNECTED),
            Self::Timeout { .. } => Some(StatusCode::BAD_TIMEOUT),
            Self::Transport(_) | Self::InvalidUrl(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(Error::Timeout { timeout_ms: 500 }.is_transient());
        assert!(!Error::NotConnected.is_transient());
    }

    #[test]
    fn status_error_displays_symbolic_name() {
        let err = Error::Status {
            operation: "Find server",
            status: StatusCode::BAD_COMMUNICATION_ERROR,
        };
        assert_eq!(err.to_string(), "Find server failed: BadCommunicationError");
    }
}
