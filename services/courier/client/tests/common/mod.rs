//! In-process broker used by the engine tests.
//!
//! Every `connect()` creates a fresh duplex stream served by a task that
//! speaks just enough of the protocol: it accepts logins, acknowledges
//! publishes, hands out subscription identities and fans every published
//! message out to every subscription on the connection. Matching is left to
//! the client. Every frame received is recorded with its connection number.
//! Switches make it refuse, reject or stay silent, and `push_frame` sends an
//! unsolicited frame on every open connection.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::BytesMut;
use courier_client::{BoxedStream, Connector};
use courier_wire::{Deliver, Frame, FrameDecoder, LoginResponse, StatusCode, DEFAULT_MAX_FRAME_SIZE};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, watch, Notify};

/// Durable name the broker refuses
pub const FORBIDDEN_DURABLE: &str = "forbidden";

struct BrokerState {
    attempts: AtomicUsize,
    connections: AtomicUsize,
    reject_logins: AtomicBool,
    refuse_connections: AtomicBool,
    ack_publishes: AtomicBool,
    reject_publishes: AtomicBool,
    ack_subscribes: AtomicBool,
    next_identity: AtomicU64,
    next_sequence: AtomicU64,
    kill: watch::Sender<u64>,
    push: broadcast::Sender<Frame>,
    frames: Mutex<Vec<(usize, Frame)>>,
    changed: Notify,
}

impl BrokerState {
    fn record(&self, conn: usize, frame: &Frame) {
        self.frames.lock().unwrap().push((conn, frame.clone()));
        self.changed.notify_waiters();
    }
}

/// Mock broker reachable through its [`Connector`] implementation
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        let (kill, _) = watch::channel(0);
        let (push, _) = broadcast::channel(16);
        Self {
            state: Arc::new(BrokerState {
                attempts: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
                reject_logins: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
                ack_publishes: AtomicBool::new(true),
                reject_publishes: AtomicBool::new(false),
                ack_subscribes: AtomicBool::new(true),
                next_identity: AtomicU64::new(1),
                next_sequence: AtomicU64::new(1),
                kill,
                push,
                frames: Mutex::new(Vec::new()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn reject_logins(&self, reject: bool) {
        self.state.reject_logins.store(reject, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn ack_publishes(&self, ack: bool) {
        self.state.ack_publishes.store(ack, Ordering::SeqCst);
    }

    /// Answer publishes with `PublishError` instead of `PublishAck`
    pub fn reject_publishes(&self, reject: bool) {
        self.state.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Leave subscribes unanswered
    pub fn ack_subscribes(&self, ack: bool) {
        self.state.ack_subscribes.store(ack, Ordering::SeqCst);
    }

    /// Calls to `connect`, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Send `frame` on every open connection
    pub fn push_frame(&self, frame: Frame) {
        let _ = self.state.push.send(frame);
    }

    /// Streams served so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Drop every open connection without a goodbye
    pub fn kill_connections(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Every frame received, with its connection number
    pub fn frames(&self) -> Vec<(usize, Frame)> {
        self.state.frames.lock().unwrap().clone()
    }

    /// Frames received that satisfy `pred`
    pub fn frames_where(&self, pred: impl Fn(usize, &Frame) -> bool) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|(conn, frame)| pred(*conn, frame))
            .map(|(_, frame)| frame)
            .collect()
    }

    /// Wait until at least `count` received frames satisfy `pred`
    pub async fn wait_for_frames(
        &self,
        count: usize,
        pred: impl Fn(usize, &Frame) -> bool,
    ) -> Vec<Frame> {
        within(async {
            loop {
                let changed = self.state.changed.notified();
                let found = self.frames_where(&pred);
                if found.len() >= count {
                    return found;
                }
                changed.await;
            }
        })
        .await
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self) -> io::Result<BoxedStream> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        let conn = self.state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(serve(self.state.clone(), conn, server));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "mock://broker".to_string()
    }
}

async fn read_frame(
    stream: &mut DuplexStream,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Option<Frame> {
    loop {
        if let Some(raw) = decoder.decode(buffer).ok()? {
            return Frame::decode(raw).ok();
        }
        if stream.read_buf(buffer).await.ok()? == 0 {
            return None;
        }
    }
}

async fn serve(state: Arc<BrokerState>, conn: usize, mut stream: DuplexStream) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = BytesMut::new();
    let mut kill = state.kill.subscribe();
    let mut push = state.push.subscribe();
    let mut subscriptions: Vec<String> = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = kill.changed() => return,
            pushed = push.recv() => {
                let Ok(frame) = pushed else {
                    continue;
                };
                let Ok(bytes) = frame.encode(DEFAULT_MAX_FRAME_SIZE) else {
                    return;
                };
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
                continue;
            }
            frame = read_frame(&mut stream, &mut decoder, &mut buffer) => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        state.record(conn, &frame);

        let replies = match frame {
            Frame::Login(login) => {
                if state.reject_logins.load(Ordering::SeqCst) {
                    vec![Frame::Error {
                        code: StatusCode::NotAuthorized,
                        reason: "bad credentials".to_string(),
                    }]
                } else {
                    vec![Frame::LoginResponse(LoginResponse {
                        client_id: login.client_id.unwrap_or_else(|| "anonymous".to_string()),
                        id_token: Some(format!("token-{}", conn)),
                        ..LoginResponse::default()
                    })]
                }
            }
            Frame::Heartbeat {
                token,
                reply: false,
            } => vec![Frame::Heartbeat { token, reply: true }],
            Frame::Publish { req_id, .. } if state.reject_publishes.load(Ordering::SeqCst) => {
                vec![Frame::PublishError {
                    req_id,
                    code: StatusCode::Invalid,
                    reason: "destination not allowed".to_string(),
                }]
            }
            Frame::Publish { req_id, message } => {
                let mut replies = Vec::new();
                if state.ack_publishes.load(Ordering::SeqCst) {
                    replies.push(Frame::PublishAck { req_id });
                }
                for identity in &subscriptions {
                    let sequence = state.next_sequence.fetch_add(1, Ordering::SeqCst);
                    replies.push(Frame::Deliver(Deliver {
                        identity: identity.clone(),
                        sequence: Some(sequence),
                        ack_token: Some(sequence),
                        redelivered: false,
                        message: message.clone(),
                    }));
                }
                replies
            }
            Frame::Subscribe(_) if !state.ack_subscribes.load(Ordering::SeqCst) => Vec::new(),
            Frame::Subscribe(subscribe) => {
                if subscribe.durable.as_deref() == Some(FORBIDDEN_DURABLE) {
                    vec![Frame::SubscribeError {
                        req_id: subscribe.req_id,
                        code: StatusCode::Disallowed,
                        reason: "durable not allowed".to_string(),
                    }]
                } else {
                    let identity = format!(
                        "sub-{}",
                        state.next_identity.fetch_add(1, Ordering::SeqCst)
                    );
                    subscriptions.push(identity.clone());
                    vec![Frame::SubscribeAck {
                        req_id: subscribe.req_id,
                        identity,
                    }]
                }
            }
            Frame::Unsubscribe { req_id, identity } => {
                subscriptions.retain(|s| s != &identity);
                vec![Frame::UnsubscribeAck { req_id, identity }]
            }
            Frame::Disconnect { .. } => return,
            _ => Vec::new(),
        };

        for reply in replies {
            let Ok(bytes) = reply.encode(DEFAULT_MAX_FRAME_SIZE) else {
                return;
            };
            if stream.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

/// Fail the test instead of hanging
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
