//! TCP/TLS transport, LOGIN handshake, heartbeats and read/write loops for courier.
//!
//! A session is one logged-in stream to the messaging server. This crate
//! opens it, keeps it alive and reports exactly once why it ended; the
//! client crate on top decides what to do about it.
//!
//! ## Features
//!
//! - **Transport**: `tcp://` and (with the `tls` feature) `tls://` endpoints
//!   behind the [`Connector`] trait
//! - **Handshake**: LOGIN / LOGIN_RESPONSE with resume token support
//! - **Keepalive**: heartbeats in both directions and a liveness timeout
//! - **Session**: background reader and writer tasks with ordered sends
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_session::{Connector, Session, SessionConfig, TcpConnector};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = TcpConnector::from_url("tcp://localhost:8585")?;
//! let stream = connector.connect().await?;
//!
//! let (session, mut inbound) = Session::open(stream, SessionConfig::default()).await?;
//! println!("Logged in as {}", session.info().client_id);
//!
//! while let Some(frame) = inbound.recv().await {
//!     println!("Received {:?}", frame.frame_type());
//! }
//! println!("Session closed: {}", inbound.closed().await);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::{CloseReason, SessionError};
pub use handshake::{login, recv_any_frame, LoginParams};
pub use keepalive::{build_heartbeat, now_token, LivenessMonitor};
pub use session::{Session, SessionConfig, SessionInbound};
pub use transport::{connect_tcp, BoxedStream, Connector, DuplexStream, Endpoint, IoStream, TcpConnector};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config, TlsClientConfig};
