//! Error types for the framecast environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (buffer full, socket error, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target node is unknown or unreachable (partition, never connected)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Link to the target was closed by the remote side or torn down locally
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Envelope serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Listening endpoint could not be opened
    #[error("Bind error on {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// Outbound queue for the target is full
    #[error("Backpressure on {0}")]
    Backpressure(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// Three-way classification of a transport result.
///
/// Every backend maps its native status space onto this at the boundary so
/// callers only ever handle three paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Ok,
    /// Transient; the link stays usable and the next frame may succeed
    Retryable,
    /// The link is gone; mark it disconnected
    Fatal,
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a closed-link error.
    pub fn closed(node: impl std::fmt::Display) -> Self {
        Self::LinkClosed(node.to_string())
    }

    /// Maps this error onto the transport status space.
    pub fn status(&self) -> TransportStatus {
        match self {
            EnvError::Timeout(_) | EnvError::Backpressure(_) => TransportStatus::Retryable,
            EnvError::NetworkError(_)
            | EnvError::NodeUnreachable(_)
            | EnvError::LinkClosed(_)
            | EnvError::SerializationError(_)
            | EnvError::BindError { .. } => TransportStatus::Fatal,
        }
    }
}

/// Maps an I/O error kind from a socket into the transport status space.
pub fn io_status(err: &std::io::Error) -> TransportStatus {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
            TransportStatus::Retryable
        }
        _ => TransportStatus::Fatal,
    }
}

/// Collapses any send result into a [`TransportStatus`].
pub fn status_of<T>(result: &Result<T, EnvError>) -> TransportStatus {
    match result {
        Ok(_) => TransportStatus::Ok,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(EnvError::Timeout(10).status(), TransportStatus::Retryable);
        assert_eq!(EnvError::closed("peer").status(), TransportStatus::Fatal);
        assert_eq!(status_of::<()>(&Ok(())), TransportStatus::Ok);
    }

    #[test]
    fn test_io_status_mapping() {
        let would_block = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);

        assert_eq!(io_status(&would_block), TransportStatus::Retryable);
        assert_eq!(io_status(&reset), TransportStatus::Fatal);
    }
}
