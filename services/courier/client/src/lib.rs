//! Connection engine, request correlation and subscription registry for courier.
//!
//! [`Connection`] is the entry point: it logs in, keeps the session alive,
//! reconnects with backoff after a loss and replays subscriptions on the new
//! session. Publishes complete through futures, subscriptions deliver through
//! bounded [`SubscriptionStream`]s, and connection-level failures arrive once
//! each on the [`ErrorStream`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_client::{ConnectOptions, Connection, Message, SubscriptionEvent};
//!
//! # async fn example() -> courier_client::Result<()> {
//! let options = ConnectOptions::new()
//!     .credentials("user", "password")
//!     .client_id("client-go");
//! let (connection, mut errors) = Connection::connect("tcp://localhost:8585", options).await?;
//!
//! tokio::spawn(async move {
//!     while let Some(error) = errors.recv().await {
//!         eprintln!("connection error: {}", error);
//!     }
//! });
//!
//! let mut stream = connection.subscribe(r#"{"type":"example"}"#, None).await?;
//!
//! connection
//!     .publish(Message::new().with_destination("sample").with("type", "example"))
//!     .await?;
//!
//! if let Some(SubscriptionEvent::Message(delivery)) = stream.recv().await {
//!     println!("received {}", delivery.message);
//! }
//!
//! connection.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod matcher;
pub mod options;
mod registry;

// Re-export main types
pub use backoff::Backoff;
pub use connection::{Completion, Connection, ConnectionState, ErrorStream, PendingPublish};
pub use correlator::{Correlator, DrainSummary, PendingRequest, RequestKind, RequestResult};
pub use error::{ClientError, Result};
pub use matcher::Matcher;
pub use options::ConnectOptions;
pub use registry::{
    AckToken, Delivery, Subscription, SubscriptionEvent, SubscriptionKey, SubscriptionOptions,
    SubscriptionStream,
};

pub use courier_session::{BoxedStream, Connector, Endpoint, TcpConnector};
pub use courier_wire::{AckMode, Array, DurableType, Message, StatusCode, Value};
