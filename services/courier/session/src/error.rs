//! Session error types.

use courier_wire::{CodecError, StatusCode, WireError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while opening or using a session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Server rejected the credentials
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Login response was missing, malformed or unexpected
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No login response within the login timeout
    #[error("login timed out after {0:?}")]
    LoginTimeout(Duration),

    /// Underlying stream failed
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent bytes that do not decode
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Outbound frame could not be encoded
    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),

    /// Session already closed
    #[error("session closed")]
    Closed,
}

/// Why a session closed; reported exactly once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No inbound activity within the heartbeat timeout
    LivenessLost,
    /// Peer closed the stream
    StreamClosed,
    /// Reading or writing the stream failed
    Io(String),
    /// Peer sent undecodable data
    Protocol(String),
    /// Peer sent a disconnect frame
    ServerDisconnect {
        /// Disconnect code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
    /// Closed by this side
    Local,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LivenessLost => write!(f, "liveness lost"),
            CloseReason::StreamClosed => write!(f, "connection closed by peer"),
            CloseReason::Io(e) => write!(f, "i/o error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::ServerDisconnect { code, reason } => {
                write!(f, "server disconnect ({}): {}", code, reason)
            }
            CloseReason::Local => write!(f, "closed locally"),
        }
    }
}
