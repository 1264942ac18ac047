//! MeshBase Error Types

use thiserror::Error;

/// Result type alias for MeshBase operations
pub type Result<T> = std::result::Result<T, Error>;

/// MeshBase error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Addressing errors
    #[error("Invalid identifier '{raw}': {reason}")]
    InvalidIdentifier { raw: String, reason: String },

    #[error("Unknown protocol '{attempted}', supported protocols: {}", supported.join(", "))]
    UnknownProtocol {
        attempted: String,
        supported: Vec<String>,
    },

    #[error("Access path hop {index} is empty")]
    EmptyHop { index: usize },

    // Wire errors
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    // Replica errors
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityExists(String),

    #[error("Lock unavailable for entity {entity}: {reason}")]
    LockUnavailable { entity: String, reason: String },

    #[error("Replica of {0} has no home")]
    NoHome(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Peer errors
    #[error("Peer unreachable: {peer}: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("Communications with {0} have ceased")]
    Ceased(String),

    #[error("Request {request_id} to {peer} timed out")]
    RequestTimeout { peer: String, request_id: u64 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockUnavailable { .. }
                | Error::RequestTimeout { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means the peer should be treated as gone
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, Error::PeerUnreachable { .. } | Error::Ceased(_))
    }

    /// Shorthand for a lock-unavailable error
    pub fn lock_unavailable(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::LockUnavailable {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_protocol_names_everything() {
        let err = Error::UnknownProtocol {
            attempted: "ftp".to_string(),
            supported: vec!["http".into(), "https".into(), "file".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("ftp"));
        assert!(msg.contains("http, https, file"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_lock_unavailable_is_retryable() {
        let err = Error::lock_unavailable("e1", "busy");
        assert!(err.is_retryable());
        assert!(!err.is_peer_failure());
        assert!(err.to_string().contains("e1"));
    }

    #[test]
    fn test_peer_failure_classification() {
        let err = Error::PeerUnreachable {
            peer: "http://a.example/".into(),
            reason: "retries exhausted".into(),
        };
        assert!(err.is_peer_failure());
        assert!(!err.is_retryable());
        assert!(Error::Ceased("http://b.example/".into()).is_peer_failure());
        assert!(!Error::NoHome("e1".into()).is_retryable());
    }
}
