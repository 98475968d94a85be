//! Core session management for courier connections.
//!
//! A [`Session`] owns one logged-in stream. Opening it performs the login
//! handshake; afterwards two background tasks run until the session closes:
//!
//! - the reader decodes inbound frames, echoes server heartbeats and forwards
//!   everything else to the [`SessionInbound`] frame stream;
//! - the writer drains the outbound queue, sends heartbeats every interval and
//!   declares the session lost when the server stays silent too long.
//!
//! Whatever ends the session, the [`CloseReason`] is reported exactly once.

use bytes::{Bytes, BytesMut};
use courier_wire::{Frame, FrameDecoder, LoginResponse, StatusCode, DEFAULT_MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::{CloseReason, SessionError};
use crate::handshake::{login, recv_any_frame, LoginParams};
use crate::keepalive::{build_heartbeat, now_token, LivenessMonitor};

/// Configuration for a courier session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Credentials and identity presented at login
    pub login: LoginParams,
    /// Interval between heartbeats, unless the server dictates one
    pub heartbeat_interval: Duration,
    /// Silence after which the session is declared lost
    pub heartbeat_timeout: Duration,
    /// Time allowed for the login handshake
    pub login_timeout: Duration,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// Decoded frames buffered for the consumer
    pub inbound_capacity: usize,
    /// Encoded frames buffered for the writer
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login: LoginParams::default(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(15),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inbound_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Liveness timeout for a negotiated heartbeat interval, keeping the
    /// configured timeout-to-interval ratio
    fn liveness_timeout(&self, interval: Duration) -> Duration {
        if interval == self.heartbeat_interval || self.heartbeat_interval.is_zero() {
            return self.heartbeat_timeout;
        }
        let ratio = self.heartbeat_timeout.as_secs_f64() / self.heartbeat_interval.as_secs_f64();
        interval.mul_f64(ratio.max(1.0))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Close notification shared by the session and its tasks
struct CloseSignal {
    closed: AtomicBool,
    notify: Mutex<Option<oneshot::Sender<CloseReason>>>,
    shutdown: watch::Sender<bool>,
}

impl CloseSignal {
    fn new(notify: oneshot::Sender<CloseReason>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Mutex::new(Some(notify)),
            shutdown,
        }
    }

    /// Close with `reason`; only the first call has any effect
    fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(%reason, "Session closing");
        if let Some(notify) = lock(&self.notify).take() {
            let _ = notify.send(reason);
        }
        self.shutdown.send_replace(true);
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Inbound side of a session: decoded frames followed by the close reason
pub struct SessionInbound {
    frames: mpsc::Receiver<Frame>,
    closed: oneshot::Receiver<CloseReason>,
}

impl SessionInbound {
    /// Next decoded frame; `None` once the session has closed
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Wait for the session to close and return why
    pub async fn closed(self) -> CloseReason {
        self.closed.await.unwrap_or(CloseReason::Local)
    }
}

/// A logged-in session over one stream
pub struct Session {
    info: LoginResponse,
    outbound: mpsc::Sender<Bytes>,
    signal: Arc<CloseSignal>,
    max_frame_size: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Log in over `stream` and start the session tasks.
    ///
    /// Fails with [`SessionError::Auth`] when the credentials are rejected and
    /// [`SessionError::Handshake`] or [`SessionError::LoginTimeout`] when the
    /// server does not complete the handshake.
    pub async fn open<S>(
        stream: S,
        config: SessionConfig,
    ) -> Result<(Session, SessionInbound), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let mut buffer = BytesMut::with_capacity(64 * 1024);

        let handshake = login(
            &mut reader,
            &mut writer,
            &mut decoder,
            &mut buffer,
            &config.login,
            config.max_frame_size,
        );
        let info = match tokio::time::timeout(config.login_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::LoginTimeout(config.login_timeout)),
        };

        let heartbeat_interval = info.heartbeat.unwrap_or(config.heartbeat_interval);
        let liveness_timeout = config.liveness_timeout(heartbeat_interval);
        let max_frame_size = info
            .max_size
            .map(|max| (max as usize).min(config.max_frame_size))
            .unwrap_or(config.max_frame_size);

        info!(
            client_id = %info.client_id,
            heartbeat = ?heartbeat_interval,
            timeout = ?liveness_timeout,
            "Session established"
        );

        let (frames_tx, frames_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (closed_tx, closed_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = Arc::new(CloseSignal::new(closed_tx, shutdown_tx));
        let liveness = Arc::new(LivenessMonitor::new(liveness_timeout));

        let reader_task = tokio::spawn(read_loop(
            ReadState {
                reader,
                decoder,
                buffer,
            },
            frames_tx,
            outbound_tx.clone(),
            liveness.clone(),
            signal.clone(),
            shutdown_rx.clone(),
            max_frame_size,
        ));
        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            heartbeat_interval,
            liveness,
            signal.clone(),
            shutdown_rx,
            max_frame_size,
        ));

        let session = Session {
            info,
            outbound: outbound_tx,
            signal,
            max_frame_size,
            tasks: Mutex::new(vec![reader_task, writer_task]),
        };
        let inbound = SessionInbound {
            frames: frames_rx,
            closed: closed_rx,
        };
        Ok((session, inbound))
    }

    /// Login reply received when the session opened
    pub fn info(&self) -> &LoginResponse {
        &self.info
    }

    /// Largest frame this session will send
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether the session has closed
    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Encode and queue a frame; frames are written in call order
    pub async fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = frame.encode(self.max_frame_size)?;
        self.send_bytes(bytes).await
    }

    /// Queue an already encoded frame
    pub async fn send_bytes(&self, bytes: Bytes) -> Result<(), SessionError> {
        if self.signal.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Send DISCONNECT, stop the session tasks and release the stream.
    ///
    /// Tasks still running after `grace` are aborted.
    pub async fn close(&self, code: StatusCode, reason: &str, grace: Duration) {
        if !self.signal.is_closed() {
            let disconnect = Frame::Disconnect {
                code,
                reason: reason.to_string(),
            };
            if let Ok(bytes) = disconnect.encode(self.max_frame_size) {
                // never wait on a full queue here
                let _ = self.outbound.try_send(bytes);
            }
        }
        self.signal.close(CloseReason::Local);

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Session task did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signal.close(CloseReason::Local);
    }
}

struct ReadState<R> {
    reader: R,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut state: ReadState<R>,
    frames: mpsc::Sender<Frame>,
    outbound: mpsc::Sender<Bytes>,
    liveness: Arc<LivenessMonitor>,
    signal: Arc<CloseSignal>,
    mut shutdown: watch::Receiver<bool>,
    max_frame: usize,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            received = recv_any_frame(&mut state.reader, &mut state.decoder, &mut state.buffer) => received,
        };

        let raw = match received {
            Ok(raw) => raw,
            Err(SessionError::Closed) => {
                info!("Server closed the connection");
                signal.close(CloseReason::StreamClosed);
                return;
            }
            Err(SessionError::Protocol(e)) => {
                warn!("Undecodable data from server: {}", e);
                signal.close(CloseReason::Protocol(e.to_string()));
                return;
            }
            Err(e) => {
                warn!("Failed to read from server: {}", e);
                signal.close(CloseReason::Io(e.to_string()));
                return;
            }
        };

        liveness.record_activity();

        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from server: {}", e);
                signal.close(CloseReason::Protocol(e.to_string()));
                return;
            }
        };

        match frame {
            Frame::Heartbeat {
                token,
                reply: false,
            } => {
                trace!(token, "Received heartbeat, echoing");
                match build_heartbeat(token, true, max_frame) {
                    Ok(bytes) => {
                        if outbound.send(bytes).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!("Failed to build heartbeat echo: {}", e),
                }
            }
            Frame::Heartbeat { token, reply: true } => {
                trace!(token, "Received heartbeat echo");
            }
            Frame::Disconnect { code, reason } => {
                info!(%code, "Server disconnected: {}", reason);
                signal.close(CloseReason::ServerDisconnect { code, reason });
                return;
            }
            frame => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    sent = frames.send(frame) => {
                        if sent.is_err() {
                            debug!("Frame consumer dropped, closing session");
                            signal.close(CloseReason::Local);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    heartbeat_interval: Duration,
    liveness: Arc<LivenessMonitor>,
    signal: Arc<CloseSignal>,
    mut shutdown: watch::Receiver<bool>,
    max_frame: usize,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                // frames queued before shutdown (e.g. DISCONNECT) still go out
                while let Ok(bytes) = outbound.try_recv() {
                    if write_frame(&mut writer, &bytes).await.is_err() {
                        break;
                    }
                }
                let _ = writer.shutdown().await;
                return;
            }

            _ = ticker.tick() => {
                if liveness.is_expired() {
                    warn!(idle = ?liveness.idle(), "No activity from server, liveness lost");
                    signal.close(CloseReason::LivenessLost);
                    continue;
                }

                let bytes = match build_heartbeat(now_token(), false, max_frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to build heartbeat: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    warn!("Failed to send heartbeat: {}", e);
                    signal.close(CloseReason::Io(e.to_string()));
                } else {
                    trace!("Sent heartbeat");
                }
            }

            bytes = outbound.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        warn!("Failed to write frame: {}", e);
                        signal.close(CloseReason::Io(e.to_string()));
                    }
                }
                None => {
                    signal.close(CloseReason::Local);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::{Message, RawFrame};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Minimal server side of a session for tests
    struct FakeServer {
        stream: DuplexStream,
        decoder: FrameDecoder,
        buffer: BytesMut,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: FrameDecoder::new(),
                buffer: BytesMut::new(),
            }
        }

        async fn recv(&mut self) -> Option<Frame> {
            loop {
                if let Some(raw) = self.decoder.decode(&mut self.buffer).unwrap() {
                    return Some(Frame::decode(raw).unwrap());
                }
                if self.stream.read_buf(&mut self.buffer).await.unwrap_or(0) == 0 {
                    return None;
                }
            }
        }

        async fn send(&mut self, frame: Frame) {
            let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn accept_login(&mut self) {
            match self.recv().await {
                Some(Frame::Login(_)) => {}
                other => panic!("expected login, got {:?}", other),
            }
            self.send(Frame::LoginResponse(LoginResponse {
                client_id: "client-1".into(),
                ..LoginResponse::default()
            }))
            .await;
        }

        /// Next frame that is not a heartbeat
        async fn recv_non_heartbeat(&mut self) -> Option<Frame> {
            loop {
                match self.recv().await {
                    Some(Frame::Heartbeat { .. }) => continue,
                    other => return other,
                }
            }
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            login_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    async fn open_pair() -> (Session, SessionInbound, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = FakeServer::new(server);
        let (opened, _) = tokio::join!(Session::open(client, test_config()), server.accept_login());
        let (session, inbound) = opened.unwrap();
        (session, inbound, server)
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (session, mut inbound, mut server) = open_pair().await;
        assert_eq!(session.info().client_id, "client-1");

        let publish = Frame::Publish {
            req_id: 1,
            message: Message::new().with_destination("sample"),
        };
        session.send(&publish).await.unwrap();
        assert_eq!(server.recv_non_heartbeat().await, Some(publish));

        server.send(Frame::PublishAck { req_id: 1 }).await;
        assert_eq!(inbound.recv().await, Some(Frame::PublishAck { req_id: 1 }));
    }

    #[tokio::test]
    async fn test_frames_pipelined_after_login_are_kept() {
        let (client, server_stream) = tokio::io::duplex(64 * 1024);
        let mut server = FakeServer::new(server_stream);

        let server_task = async {
            assert!(matches!(server.recv().await, Some(Frame::Login(_))));
            let mut bytes = BytesMut::new();
            bytes.extend_from_slice(
                &Frame::LoginResponse(LoginResponse {
                    client_id: "c".into(),
                    ..LoginResponse::default()
                })
                .encode(DEFAULT_MAX_FRAME_SIZE)
                .unwrap(),
            );
            bytes.extend_from_slice(
                &Frame::PublishAck { req_id: 9 }
                    .encode(DEFAULT_MAX_FRAME_SIZE)
                    .unwrap(),
            );
            server.stream.write_all(&bytes).await.unwrap();
        };

        let (opened, _) = tokio::join!(Session::open(client, test_config()), server_task);
        let (_session, mut inbound) = opened.unwrap();
        assert_eq!(inbound.recv().await, Some(Frame::PublishAck { req_id: 9 }));
    }

    #[tokio::test]
    async fn test_server_heartbeat_is_echoed_and_hidden() {
        let (_session, mut inbound, mut server) = open_pair().await;

        server
            .send(Frame::Heartbeat {
                token: 5,
                reply: false,
            })
            .await;
        loop {
            match server.recv().await {
                Some(Frame::Heartbeat { token: 5, reply: true }) => break,
                Some(Frame::Heartbeat { .. }) => continue,
                other => panic!("expected heartbeat echo, got {:?}", other),
            }
        }

        server.send(Frame::PublishAck { req_id: 2 }).await;
        assert_eq!(inbound.recv().await, Some(Frame::PublishAck { req_id: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_lost_when_server_is_silent() {
        let (session, mut inbound, _server) = open_pair().await;

        assert_eq!(inbound.recv().await, None);
        assert_eq!(inbound.closed().await, CloseReason::LivenessLost);
        assert!(session.is_closed());
        assert!(matches!(
            session.send(&Frame::PublishAck { req_id: 1 }).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_server_disconnect_closes_session() {
        let (_session, inbound, mut server) = open_pair().await;
        server
            .send(Frame::Disconnect {
                code: StatusCode::Restart,
                reason: "maintenance".into(),
            })
            .await;

        assert_eq!(
            inbound.closed().await,
            CloseReason::ServerDisconnect {
                code: StatusCode::Restart,
                reason: "maintenance".into()
            }
        );
    }

    #[tokio::test]
    async fn test_stream_closure_is_reported() {
        let (_session, mut inbound, server) = open_pair().await;
        drop(server);

        assert_eq!(inbound.recv().await, None);
        assert_eq!(inbound.closed().await, CloseReason::StreamClosed);
    }

    #[tokio::test]
    async fn test_close_sends_disconnect() {
        let (session, inbound, mut server) = open_pair().await;
        session
            .close(StatusCode::Ok, "client disconnect", Duration::from_secs(1))
            .await;

        assert!(matches!(
            server.recv_non_heartbeat().await,
            Some(Frame::Disconnect { code: StatusCode::Ok, .. })
        ));
        assert_eq!(server.recv_non_heartbeat().await, None);
        assert_eq!(inbound.closed().await, CloseReason::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_timeout() {
        let (client, _server) = tokio::io::duplex(1024);
        let result = Session::open(client, test_config()).await;
        assert!(matches!(result, Err(SessionError::LoginTimeout(_))));
    }

    #[tokio::test]
    async fn test_close_signal_fires_once() {
        let (tx, rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = CloseSignal::new(tx, shutdown_tx);

        assert!(signal.close(CloseReason::LivenessLost));
        assert!(!signal.close(CloseReason::StreamClosed));
        assert_eq!(rx.await.unwrap(), CloseReason::LivenessLost);
        assert!(*shutdown_rx.borrow());
    }

    #[test]
    fn test_liveness_timeout_scales_with_server_interval() {
        let config = test_config();
        assert_eq!(config.liveness_timeout(Duration::from_secs(1)), Duration::from_secs(3));
        assert_eq!(config.liveness_timeout(Duration::from_secs(4)), Duration::from_secs(12));
    }

    #[test]
    fn test_raw_frame_type_is_preserved() {
        let bytes = Frame::PublishAck { req_id: 3 }
            .encode(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let raw = RawFrame::from_bytes(&bytes).unwrap();
        assert_eq!(raw.header.req_id, 3);
    }
}
