//! Client error types.

use courier_session::{CloseReason, SessionError};
use courier_wire::{CodecError, StatusCode};
use thiserror::Error;

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the connection engine
#[derive(Error, Debug)]
pub enum ClientError {
    /// Server rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Login handshake failed or timed out
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Server sent data that violates the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connecting, reading or writing the transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Server stayed silent past the heartbeat timeout
    #[error("connection liveness lost")]
    LivenessLost,

    /// Matcher is not a JSON object of string or integer values
    #[error("invalid matcher: {0}")]
    InvalidMatcher(String),

    /// Argument rejected before anything was sent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Message could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] CodecError),

    /// Operation requires a connected engine
    #[error("not connected")]
    NotConnected,

    /// Subscription or acknowledgment token is unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection dropped before the publish was acknowledged
    #[error("publish outcome unknown: connection lost before acknowledgment")]
    PublishUncertain,

    /// Connection dropped before the request completed
    #[error("connection lost")]
    ConnectionLost,

    /// Server refused the request
    #[error("rejected by server ({code}): {reason}")]
    Rejected {
        /// Status code sent by the server
        code: StatusCode,
        /// Reason sent by the server
        reason: String,
    },

    /// Engine was disconnected by the application
    #[error("client shut down")]
    Shutdown,
}

impl ClientError {
    /// Errors that must not trigger an automatic reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Auth(_))
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Auth(reason) => ClientError::Auth(reason),
            SessionError::Handshake(reason) => ClientError::Handshake(reason),
            SessionError::LoginTimeout(after) => {
                ClientError::Handshake(format!("no login response within {:?}", after))
            }
            SessionError::Io(e) => ClientError::Transport(e.to_string()),
            SessionError::Protocol(e) => ClientError::Protocol(e.to_string()),
            SessionError::Codec(e) => ClientError::Encoding(e),
            SessionError::Closed => ClientError::Transport("session closed".to_string()),
        }
    }
}

impl From<CloseReason> for ClientError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::LivenessLost => ClientError::LivenessLost,
            CloseReason::StreamClosed => {
                ClientError::Transport("connection closed by server".to_string())
            }
            CloseReason::Io(e) => ClientError::Transport(e),
            CloseReason::Protocol(e) => ClientError::Protocol(e),
            CloseReason::ServerDisconnect {
                code: StatusCode::NotAuthorized,
                reason,
            } => ClientError::Auth(reason),
            CloseReason::ServerDisconnect { code, reason } => ClientError::Transport(format!(
                "server disconnected ({}): {}",
                code, reason
            )),
            CloseReason::Local => ClientError::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_mapping() {
        assert!(matches!(
            ClientError::from(CloseReason::LivenessLost),
            ClientError::LivenessLost
        ));
        assert!(matches!(
            ClientError::from(CloseReason::Local),
            ClientError::Shutdown
        ));

        let auth = ClientError::from(CloseReason::ServerDisconnect {
            code: StatusCode::NotAuthorized,
            reason: "revoked".into(),
        });
        assert!(auth.is_fatal());

        let restart = ClientError::from(CloseReason::ServerDisconnect {
            code: StatusCode::Restart,
            reason: "maintenance".into(),
        });
        assert!(matches!(restart, ClientError::Transport(_)));
        assert!(!restart.is_fatal());
    }

    #[test]
    fn test_session_error_mapping() {
        let err = ClientError::from(SessionError::Auth("bad password".into()));
        assert!(matches!(err, ClientError::Auth(ref r) if r == "bad password"));

        let err = ClientError::from(SessionError::LoginTimeout(std::time::Duration::from_secs(15)));
        assert!(matches!(err, ClientError::Handshake(_)));

        let err = ClientError::from(SessionError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
