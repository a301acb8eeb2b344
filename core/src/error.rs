//! Structured error types for seeker
//!
//! Duplicate and stale submissions are benign: they surface to observers as
//! `accepted = false` acks and never reach the agent. Store unavailability is
//! the only condition the agent cannot recover from.

use thiserror::Error;

use crate::config::ConfigError;
use crate::request::{RequestId, RequestKind, RequestStatus};

/// Primary error type for seeker operations
#[derive(Error, Debug)]
pub enum SeekerError {
    // =========================================================================
    // Request Registry Errors
    // =========================================================================
    /// Unknown or already-pruned id
    #[error("request not found: {id}")]
    NotFound { id: RequestId },

    /// A terminal transition was already recorded
    #[error("request {id} already {status}")]
    AlreadyResolved { id: RequestId, status: RequestStatus },

    /// Text answer for an approval, or a decision for an input
    #[error("response does not answer a {expected} request ({id})")]
    KindMismatch { id: RequestId, expected: RequestKind },

    /// The store has been shut down; nobody can answer the agent
    #[error("request store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Observer link dropped
    #[error("observer transport disconnected: {reason}")]
    TransportDisconnected { reason: String },

    /// Could not establish the observer link
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Frame that does not parse as a protocol message
    #[error("invalid message: {message}")]
    InvalidMessage { message: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),
}

impl SeekerError {
    /// Duplicate or stale submissions that should be reported as a rejected
    /// ack rather than an error.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::AlreadyResolved { .. } | Self::KindMismatch { .. }
        )
    }

    /// Fatal for the agent: there is no safe default for "cannot reach a
    /// human at all".
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl From<serde_json::Error> for SeekerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SeekerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::TransportDisconnected {
                reason: "connection closed".to_string(),
            },
            WsError::Io(io) => Self::TransportDisconnected {
                reason: io.to_string(),
            },
            other => Self::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias using SeekerError
pub type Result<T> = std::result::Result<T, SeekerError>;
