//! Typed protocol frames.
//!
//! [`Frame`] is the semantic view of a [`RawFrame`]: control fields are
//! carried in CBOR metadata, message bodies in the frame body.

use crate::codec::{
    get_meta_str, get_meta_u32, get_meta_u64, parse_meta, require_meta_str, require_meta_u64,
    CodecError, FrameBuilder, MetaBuilder,
};
use crate::frame::RawFrame;
use crate::header::{Flags, FrameHeader, FrameType, StatusCode};
use crate::message::Message;
use crate::WireError;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Protocol version announced at login
pub const PROTOCOL_VERSION: u32 = 1;

const META_USER: &str = "user";
const META_PASSWORD: &str = "password";
const META_CLIENT_ID: &str = "client_id";
const META_ID_TOKEN: &str = "id_token";
const META_VERSION: &str = "version";
const META_HEARTBEAT_MS: &str = "heartbeat_ms";
const META_MAX_SIZE: &str = "max_size";
const META_MATCHER: &str = "matcher";
const META_DURABLE: &str = "durable";
const META_DURABLE_TYPE: &str = "durable_type";
const META_DURABLE_KEY: &str = "durable_key";
const META_ACK_MODE: &str = "ack";
const META_IDENTITY: &str = "identity";
const META_SEQUENCE: &str = "seq";
const META_TOKEN: &str = "token";
const META_REASON: &str = "reason";

/// How deliveries on a subscription are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AckMode {
    /// Acknowledged by the client library once queued for the application
    #[default]
    Auto,
    /// Acknowledged explicitly by the application
    Client,
    /// Never acknowledged
    None,
}

impl AckMode {
    fn as_str(self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::None => "none",
        }
    }

    fn parse(value: &str) -> Result<Self, WireError> {
        match value {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "none" => Ok(AckMode::None),
            _ => Err(WireError::Malformed("unknown ack mode")),
        }
    }
}

/// Server-side behavior of a durable subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DurableType {
    /// One consumer, every message retained until acknowledged
    #[default]
    Standard,
    /// Messages spread across every consumer sharing the durable name
    Shared,
    /// Only the last message per value of `key` is retained
    LastValue {
        /// Field whose value partitions retained messages
        key: String,
    },
}

impl DurableType {
    fn as_str(&self) -> &'static str {
        match self {
            DurableType::Standard => "standard",
            DurableType::Shared => "shared",
            DurableType::LastValue { .. } => "last-value",
        }
    }
}

/// Login request
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Login {
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Client identifier; required for durable subscriptions
    pub client_id: Option<String>,
    /// Resume token returned by an earlier login
    pub id_token: Option<String>,
    /// Protocol version
    pub version: u32,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("id_token", &self.id_token)
            .field("version", &self.version)
            .finish()
    }
}

/// Successful login reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginResponse {
    /// Client identifier assigned or confirmed by the server
    pub client_id: String,
    /// Token used to resume this client's state on reconnect
    pub id_token: Option<String>,
    /// Heartbeat interval requested by the server
    pub heartbeat: Option<Duration>,
    /// Largest frame the server accepts
    pub max_size: Option<u32>,
}

/// Subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Request id
    pub req_id: u64,
    /// Canonical matcher text
    pub matcher: String,
    /// Durable name, if any
    pub durable: Option<String>,
    /// Durable behavior; ignored without a durable name
    pub durable_type: DurableType,
    /// Acknowledgment mode
    pub ack_mode: AckMode,
}

/// Message delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Deliver {
    /// Server identity of the subscription
    pub identity: String,
    /// Delivery sequence number
    pub sequence: Option<u64>,
    /// Token to acknowledge this delivery with
    pub ack_token: Option<u64>,
    /// Delivered before on an earlier session
    pub redelivered: bool,
    /// The message
    pub message: Message,
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client login
    Login(Login),
    /// Login accepted
    LoginResponse(LoginResponse),
    /// Heartbeat; `reply` marks an echo of the peer's heartbeat
    Heartbeat {
        /// Token echoed by the peer
        token: u64,
        /// Whether this is an echo
        reply: bool,
    },
    /// Publish a message
    Publish {
        /// Request id
        req_id: u64,
        /// Message to publish
        message: Message,
    },
    /// Publish accepted
    PublishAck {
        /// Request id
        req_id: u64,
    },
    /// Publish rejected
    PublishError {
        /// Request id
        req_id: u64,
        /// Rejection code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
    /// Create a subscription
    Subscribe(Subscribe),
    /// Subscription accepted
    SubscribeAck {
        /// Request id
        req_id: u64,
        /// Server identity of the subscription
        identity: String,
    },
    /// Subscription rejected
    SubscribeError {
        /// Request id
        req_id: u64,
        /// Rejection code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
    /// Remove a subscription
    Unsubscribe {
        /// Request id
        req_id: u64,
        /// Server identity of the subscription
        identity: String,
    },
    /// Subscription removed
    UnsubscribeAck {
        /// Request id
        req_id: u64,
        /// Server identity of the subscription
        identity: String,
    },
    /// Message delivery
    Deliver(Deliver),
    /// Acknowledge one delivery, or every delivery up to `token`
    Acknowledge {
        /// Server identity of the subscription
        identity: String,
        /// Delivery token
        token: u64,
        /// Acknowledge everything up to and including `token`
        cumulative: bool,
    },
    /// Session termination
    Disconnect {
        /// Reason code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
    /// Error not tied to a request
    Error {
        /// Error code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
}

impl Frame {
    /// Frame type on the wire
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Login(_) => FrameType::Login,
            Frame::LoginResponse(_) => FrameType::LoginResponse,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::PublishAck { .. } => FrameType::PublishAck,
            Frame::PublishError { .. } => FrameType::PublishError,
            Frame::Subscribe(_) => FrameType::Subscribe,
            Frame::SubscribeAck { .. } => FrameType::SubscribeAck,
            Frame::SubscribeError { .. } => FrameType::SubscribeError,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::UnsubscribeAck { .. } => FrameType::UnsubscribeAck,
            Frame::Deliver(_) => FrameType::Deliver,
            Frame::Acknowledge { .. } => FrameType::Acknowledge,
            Frame::Disconnect { .. } => FrameType::Disconnect,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Request id carried by correlated frames
    pub fn req_id(&self) -> Option<u64> {
        match self {
            Frame::Publish { req_id, .. }
            | Frame::PublishAck { req_id }
            | Frame::PublishError { req_id, .. }
            | Frame::SubscribeAck { req_id, .. }
            | Frame::SubscribeError { req_id, .. }
            | Frame::Unsubscribe { req_id, .. }
            | Frame::UnsubscribeAck { req_id, .. } => Some(*req_id),
            Frame::Subscribe(subscribe) => Some(subscribe.req_id),
            _ => None,
        }
    }

    /// Encode to wire bytes.
    ///
    /// A publish whose message lacks a string `_dest` field fails with
    /// [`CodecError::MissingDestination`].
    pub fn encode(&self, max_frame: usize) -> Result<Bytes, CodecError> {
        let typ = self.frame_type();
        let (header, meta, body) = match self {
            Frame::Login(login) => (
                FrameHeader::new(typ, 0),
                MetaBuilder::new()
                    .insert_opt_str(META_USER, login.user.as_deref())
                    .insert_opt_str(META_PASSWORD, login.password.as_deref())
                    .insert_opt_str(META_CLIENT_ID, login.client_id.as_deref())
                    .insert_opt_str(META_ID_TOKEN, login.id_token.as_deref())
                    .insert_u32(META_VERSION, login.version),
                Bytes::new(),
            ),
            Frame::LoginResponse(response) => (
                FrameHeader::new(typ, 0),
                MetaBuilder::new()
                    .insert_str(META_CLIENT_ID, &response.client_id)
                    .insert_opt_str(META_ID_TOKEN, response.id_token.as_deref())
                    .insert_opt_u64(
                        META_HEARTBEAT_MS,
                        response.heartbeat.map(|d| d.as_millis() as u64),
                    )
                    .insert_opt_u64(META_MAX_SIZE, response.max_size.map(u64::from)),
                Bytes::new(),
            ),
            Frame::Heartbeat { token, reply } => {
                let flags = if *reply { Flags::REPLY } else { Flags::empty() };
                (
                    FrameHeader::new(typ, *token).with_flags(flags),
                    MetaBuilder::new(),
                    Bytes::new(),
                )
            }
            Frame::Publish { req_id, message } => {
                if message.destination().is_none() {
                    return Err(CodecError::MissingDestination);
                }
                (FrameHeader::new(typ, *req_id), MetaBuilder::new(), message.encode()?)
            }
            Frame::PublishAck { req_id } => {
                (FrameHeader::new(typ, *req_id), MetaBuilder::new(), Bytes::new())
            }
            Frame::PublishError { req_id, code, reason }
            | Frame::SubscribeError { req_id, code, reason } => (
                FrameHeader::new(typ, *req_id).with_code(*code),
                MetaBuilder::new().insert_str(META_REASON, reason),
                Bytes::new(),
            ),
            Frame::Subscribe(subscribe) => {
                let mut meta = MetaBuilder::new()
                    .insert_str(META_MATCHER, &subscribe.matcher)
                    .insert_str(META_ACK_MODE, subscribe.ack_mode.as_str())
                    .insert_opt_str(META_DURABLE, subscribe.durable.as_deref());
                if subscribe.durable.is_some() {
                    meta = meta.insert_str(META_DURABLE_TYPE, subscribe.durable_type.as_str());
                    if let DurableType::LastValue { key } = &subscribe.durable_type {
                        meta = meta.insert_str(META_DURABLE_KEY, key);
                    }
                }
                (FrameHeader::new(typ, subscribe.req_id), meta, Bytes::new())
            }
            Frame::SubscribeAck { req_id, identity }
            | Frame::Unsubscribe { req_id, identity }
            | Frame::UnsubscribeAck { req_id, identity } => (
                FrameHeader::new(typ, *req_id),
                MetaBuilder::new().insert_str(META_IDENTITY, identity),
                Bytes::new(),
            ),
            Frame::Deliver(deliver) => {
                let flags = if deliver.redelivered {
                    Flags::REDELIVERED
                } else {
                    Flags::empty()
                };
                (
                    FrameHeader::new(typ, 0).with_flags(flags),
                    MetaBuilder::new()
                        .insert_str(META_IDENTITY, &deliver.identity)
                        .insert_opt_u64(META_SEQUENCE, deliver.sequence)
                        .insert_opt_u64(META_TOKEN, deliver.ack_token),
                    deliver.message.encode()?,
                )
            }
            Frame::Acknowledge {
                identity,
                token,
                cumulative,
            } => {
                let flags = if *cumulative {
                    Flags::CUMULATIVE
                } else {
                    Flags::empty()
                };
                (
                    FrameHeader::new(typ, 0).with_flags(flags),
                    MetaBuilder::new()
                        .insert_str(META_IDENTITY, identity)
                        .insert_u64(META_TOKEN, *token),
                    Bytes::new(),
                )
            }
            Frame::Disconnect { code, reason } | Frame::Error { code, reason } => (
                FrameHeader::new(typ, 0).with_code(*code),
                MetaBuilder::new().insert_str(META_REASON, reason),
                Bytes::new(),
            ),
        };

        FrameBuilder::new(header)
            .meta(meta)
            .body(body)
            .build(max_frame)
    }

    /// Interpret a raw frame
    pub fn decode(raw: RawFrame) -> Result<Self, WireError> {
        let header = raw.header;
        let meta = parse_meta(&raw.meta_raw)?;
        let req_id = header.req_id;
        let reason = || get_meta_str(&meta, META_REASON).unwrap_or_default();

        let frame = match header.typ {
            FrameType::Login => Frame::Login(Login {
                user: get_meta_str(&meta, META_USER),
                password: get_meta_str(&meta, META_PASSWORD),
                client_id: get_meta_str(&meta, META_CLIENT_ID),
                id_token: get_meta_str(&meta, META_ID_TOKEN),
                version: get_meta_u32(&meta, META_VERSION)
                    .ok_or(WireError::MissingField(META_VERSION))?,
            }),
            FrameType::LoginResponse => Frame::LoginResponse(LoginResponse {
                client_id: require_meta_str(&meta, META_CLIENT_ID)?,
                id_token: get_meta_str(&meta, META_ID_TOKEN),
                heartbeat: get_meta_u64(&meta, META_HEARTBEAT_MS)
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis),
                max_size: get_meta_u32(&meta, META_MAX_SIZE),
            }),
            FrameType::Heartbeat => Frame::Heartbeat {
                token: req_id,
                reply: header.flags.contains(Flags::REPLY),
            },
            FrameType::Publish => Frame::Publish {
                req_id,
                message: Message::decode(&raw.body)?,
            },
            FrameType::PublishAck => Frame::PublishAck { req_id },
            FrameType::PublishError => Frame::PublishError {
                req_id,
                code: header.code,
                reason: reason(),
            },
            FrameType::Subscribe => {
                let durable = get_meta_str(&meta, META_DURABLE);
                let durable_type = match get_meta_str(&meta, META_DURABLE_TYPE).as_deref() {
                    None | Some("standard") => DurableType::Standard,
                    Some("shared") => DurableType::Shared,
                    Some("last-value") => DurableType::LastValue {
                        key: require_meta_str(&meta, META_DURABLE_KEY)?,
                    },
                    Some(_) => return Err(WireError::Malformed("unknown durable type")),
                };
                Frame::Subscribe(Subscribe {
                    req_id,
                    matcher: require_meta_str(&meta, META_MATCHER)?,
                    durable,
                    durable_type,
                    ack_mode: match get_meta_str(&meta, META_ACK_MODE) {
                        Some(mode) => AckMode::parse(&mode)?,
                        None => AckMode::Auto,
                    },
                })
            }
            FrameType::SubscribeAck => Frame::SubscribeAck {
                req_id,
                identity: require_meta_str(&meta, META_IDENTITY)?,
            },
            FrameType::SubscribeError => Frame::SubscribeError {
                req_id,
                code: header.code,
                reason: reason(),
            },
            FrameType::Unsubscribe => Frame::Unsubscribe {
                req_id,
                identity: require_meta_str(&meta, META_IDENTITY)?,
            },
            FrameType::UnsubscribeAck => Frame::UnsubscribeAck {
                req_id,
                identity: require_meta_str(&meta, META_IDENTITY)?,
            },
            FrameType::Deliver => Frame::Deliver(Deliver {
                identity: require_meta_str(&meta, META_IDENTITY)?,
                sequence: get_meta_u64(&meta, META_SEQUENCE),
                ack_token: get_meta_u64(&meta, META_TOKEN),
                redelivered: header.flags.contains(Flags::REDELIVERED),
                message: Message::decode(&raw.body)?,
            }),
            FrameType::Acknowledge => Frame::Acknowledge {
                identity: require_meta_str(&meta, META_IDENTITY)?,
                token: require_meta_u64(&meta, META_TOKEN)?,
                cumulative: header.flags.contains(Flags::CUMULATIVE),
            },
            FrameType::Disconnect => Frame::Disconnect {
                code: header.code,
                reason: reason(),
            },
            FrameType::Error => Frame::Error {
                code: header.code,
                reason: reason(),
            },
        };

        Ok(frame)
    }
}

/// Decode exactly one complete encoded frame
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    Frame::decode(RawFrame::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_FRAME_SIZE;

    fn round_trip(frame: Frame) -> Frame {
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        decode_frame(&bytes).unwrap()
    }

    #[test]
    fn test_control_frames_round_trip() {
        let frames = vec![
            Frame::Login(Login {
                user: Some("user".into()),
                password: Some("pass".into()),
                client_id: Some("client-go".into()),
                id_token: None,
                version: PROTOCOL_VERSION,
            }),
            Frame::LoginResponse(LoginResponse {
                client_id: "client-go".into(),
                id_token: Some("tok".into()),
                heartbeat: Some(Duration::from_secs(5)),
                max_size: Some(1024),
            }),
            Frame::Heartbeat { token: 9, reply: true },
            Frame::PublishError {
                req_id: 3,
                code: StatusCode::Disallowed,
                reason: "no".into(),
            },
            Frame::Subscribe(Subscribe {
                req_id: 4,
                matcher: r#"{"type":"example"}"#.into(),
                durable: Some("example".into()),
                durable_type: DurableType::LastValue { key: "type".into() },
                ack_mode: AckMode::Client,
            }),
            Frame::SubscribeAck { req_id: 4, identity: "sub-1".into() },
            Frame::UnsubscribeAck { req_id: 5, identity: "sub-1".into() },
            Frame::Acknowledge {
                identity: "sub-1".into(),
                token: 77,
                cumulative: true,
            },
            Frame::Disconnect {
                code: StatusCode::Restart,
                reason: "maintenance".into(),
            },
        ];

        for frame in frames {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_deliver_round_trip() {
        let frame = Frame::Deliver(Deliver {
            identity: "sub-7".into(),
            sequence: Some(12),
            ack_token: Some(12),
            redelivered: true,
            message: Message::new().with("type", "example").with("n", 1i64),
        });
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_publish_requires_destination() {
        let frame = Frame::Publish {
            req_id: 1,
            message: Message::new().with("type", "example"),
        };
        assert!(matches!(
            frame.encode(DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::MissingDestination)
        ));

        let frame = Frame::Publish {
            req_id: 1,
            message: Message::new().with("_dest", 5i64),
        };
        assert!(matches!(
            frame.encode(DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::MissingDestination)
        ));

        let frame = Frame::Publish {
            req_id: 1,
            message: Message::new().with_destination("sample"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_missing_required_meta() {
        let bytes = FrameBuilder::new(FrameHeader::new(FrameType::SubscribeAck, 1))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        assert_eq!(
            decode_frame(&bytes),
            Err(WireError::MissingField("identity"))
        );
    }

    #[test]
    fn test_decode_never_panics_on_truncation() {
        let bytes = Frame::Deliver(Deliver {
            identity: "sub-7".into(),
            sequence: None,
            ack_token: None,
            redelivered: false,
            message: Message::new().with_destination("x").with("n", 1i64),
        })
        .encode(DEFAULT_MAX_FRAME_SIZE)
        .unwrap();

        for len in 0..bytes.len() {
            assert!(decode_frame(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn test_login_debug_hides_password() {
        let login = Login {
            password: Some("secret".into()),
            ..Login::default()
        };
        assert!(!format!("{:?}", login).contains("secret"));
    }
}
