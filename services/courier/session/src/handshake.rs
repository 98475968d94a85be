//! Login handshake for courier sessions.
//!
//! The client sends LOGIN immediately after the stream is established and
//! waits for either LOGIN_RESPONSE or an ERROR/DISCONNECT frame. Rejections
//! with [`StatusCode::NotAuthorized`] are authentication failures; anything
//! else that is not a login response fails the handshake.

use bytes::BytesMut;
use courier_wire::{Frame, FrameDecoder, Login, LoginResponse, RawFrame, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::SessionError;

/// Credentials and identity presented at login
#[derive(Debug, Clone, Default)]
pub struct LoginParams {
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Client identifier; required for durable subscriptions
    pub client_id: Option<String>,
    /// Resume token from an earlier login of the same client
    pub id_token: Option<String>,
}

impl LoginParams {
    fn to_frame(&self) -> Frame {
        Frame::Login(Login {
            user: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            id_token: self.id_token.clone(),
            version: courier_wire::PROTOCOL_VERSION,
        })
    }
}

/// Send LOGIN and wait for the server's answer
pub async fn login<R, W>(
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    params: &LoginParams,
    max_frame: usize,
) -> Result<LoginResponse, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let login_bytes = params.to_frame().encode(max_frame)?;
    writer.write_all(&login_bytes).await?;
    writer.flush().await?;
    debug!(client_id = ?params.client_id, "Sent LOGIN");

    let raw = match recv_any_frame(reader, decoder, buffer).await {
        Ok(raw) => raw,
        Err(SessionError::Closed) => {
            return Err(SessionError::Handshake(
                "connection closed during login".to_string(),
            ))
        }
        Err(SessionError::Protocol(e)) => return Err(SessionError::Handshake(e.to_string())),
        Err(e) => return Err(e),
    };

    match Frame::decode(raw) {
        Ok(Frame::LoginResponse(response)) => {
            debug!(client_id = %response.client_id, "Received LOGIN_RESPONSE");
            Ok(response)
        }
        Ok(Frame::Error {
            code: StatusCode::NotAuthorized,
            reason,
        })
        | Ok(Frame::Disconnect {
            code: StatusCode::NotAuthorized,
            reason,
        }) => Err(SessionError::Auth(reason)),
        Ok(Frame::Error { code, reason }) | Ok(Frame::Disconnect { code, reason }) => Err(
            SessionError::Handshake(format!("login refused ({}): {}", code, reason)),
        ),
        Ok(other) => Err(SessionError::Handshake(format!(
            "unexpected {:?} frame during login",
            other.frame_type()
        ))),
        Err(e) => Err(SessionError::Handshake(e.to_string())),
    }
}

/// Read the next raw frame, using bytes already buffered first.
///
/// Fails with [`SessionError::Closed`] on end of stream.
pub async fn recv_any_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<RawFrame, SessionError> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(frame);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(SessionError::Closed);
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::DEFAULT_MAX_FRAME_SIZE;

    async fn run_login(reply: Vec<u8>) -> (Result<LoginResponse, SessionError>, Vec<u8>) {
        let mut reader = std::io::Cursor::new(reply);
        let mut written = Vec::new();
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let params = LoginParams {
            username: Some("user".into()),
            password: Some("pass".into()),
            client_id: Some("client-go".into()),
            id_token: None,
        };
        let result = login(
            &mut reader,
            &mut written,
            &mut decoder,
            &mut buffer,
            &params,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await;
        (result, written)
    }

    #[tokio::test]
    async fn test_login_success() {
        let reply = Frame::LoginResponse(LoginResponse {
            client_id: "client-go".into(),
            ..LoginResponse::default()
        })
        .encode(DEFAULT_MAX_FRAME_SIZE)
        .unwrap();

        let (result, written) = run_login(reply.to_vec()).await;
        assert_eq!(result.unwrap().client_id, "client-go");

        match courier_wire::decode_frame(&written).unwrap() {
            Frame::Login(login) => {
                assert_eq!(login.user.as_deref(), Some("user"));
                assert_eq!(login.client_id.as_deref(), Some("client-go"));
            }
            other => panic!("expected login, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let reply = Frame::Error {
            code: StatusCode::NotAuthorized,
            reason: "bad credentials".into(),
        }
        .encode(DEFAULT_MAX_FRAME_SIZE)
        .unwrap();

        let (result, _) = run_login(reply.to_vec()).await;
        assert!(matches!(result, Err(SessionError::Auth(reason)) if reason == "bad credentials"));
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_handshake() {
        let mut garbage = vec![0, 0, 0, 20];
        garbage.extend_from_slice(&[9u8; 20]);
        let (result, _) = run_login(garbage).await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));

        let (result, _) = run_login(Vec::new()).await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));

        let unexpected = Frame::PublishAck { req_id: 1 }
            .encode(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let (result, _) = run_login(unexpected.to_vec()).await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_buffered_frames_are_read_first() {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&Frame::PublishAck { req_id: 1 }.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        bytes.extend_from_slice(&Frame::PublishAck { req_id: 2 }.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut reader = tokio::io::empty();
        let mut decoder = FrameDecoder::new();
        let first = recv_any_frame(&mut reader, &mut decoder, &mut bytes).await.unwrap();
        let second = recv_any_frame(&mut reader, &mut decoder, &mut bytes).await.unwrap();
        assert_eq!(first.header.req_id, 1);
        assert_eq!(second.header.req_id, 2);
        assert!(matches!(
            recv_any_frame(&mut reader, &mut decoder, &mut bytes).await,
            Err(SessionError::Closed)
        ));
    }
}
