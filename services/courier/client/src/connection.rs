//! Connection engine.
//!
//! [`Connection`] owns at most one live [`Session`] and multiplexes publish,
//! subscribe and acknowledgment traffic over it. Each installed session gets
//! an epoch; the dispatcher task of that epoch routes inbound frames to the
//! correlator or the registry and reports the session's end. Anything that
//! carries an older epoch is stale and ignored.
//!
//! State transitions and every write that must be ordered happen behind one
//! async mutex. Connection attempts run outside it and are only installed if
//! nothing changed while they ran.

use courier_session::{CloseReason, Connector, Session, SessionInbound, TcpConnector};
use courier_wire::{Frame, LoginResponse, Message, StatusCode};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::correlator::{Correlator, PendingRequest, RequestKind, RequestResult};
use crate::error::{ClientError, Result};
use crate::options::ConnectOptions;
use crate::registry::{
    Delivery, Registry, Removal, Routed, SubscribeAckOutcome, Subscription, SubscriptionEvent,
    SubscriptionKey, SubscriptionOptions, SubscriptionStream,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt in progress
    Disconnected,
    /// First or explicit connection attempt in progress
    Connecting,
    /// Session established
    Connected,
    /// Session lost; automatic reconnection in progress
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Connection-scoped errors, each reported once
pub struct ErrorStream {
    rx: mpsc::Receiver<ClientError>,
}

impl ErrorStream {
    /// Next error; `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<ClientError> {
        self.rx.recv().await
    }

    /// Next error if one is already queued
    pub fn try_recv(&mut self) -> Option<ClientError> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ErrorStream {
    type Item = ClientError;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Outcome of an asynchronous publish
#[derive(Debug)]
pub struct Completion {
    /// Request id of the publish
    pub request_id: u64,
    /// The published message
    pub message: Message,
    /// Whether the server accepted it
    pub result: Result<()>,
}

/// Future resolving once the server answers a publish
pub struct PendingPublish {
    request_id: u64,
    message: Option<Message>,
    rx: oneshot::Receiver<RequestResult>,
}

impl PendingPublish {
    /// Request id of the publish
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for PendingPublish {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        let this = self.get_mut();
        let result = match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(ClientError::PublishUncertain),
        };
        Poll::Ready(Completion {
            request_id: this.request_id,
            message: this.message.take().unwrap_or_default(),
            result,
        })
    }
}

struct Core {
    session: Option<Arc<Session>>,
    epoch: u64,
    dispatcher: Option<JoinHandle<()>>,
    reconnector: Option<JoinHandle<()>>,
    backoff: Backoff,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    core: Mutex<Core>,
    state: watch::Sender<ConnectionState>,
    correlator: Correlator,
    registry: Registry,
    errors: mpsc::Sender<ClientError>,
    login: StdMutex<Option<LoginResponse>>,
}

/// Handle to a courier connection; cheap to clone
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to a `tcp://host:port` or `tls://host:port` URL
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<(Connection, ErrorStream)> {
        let connector = TcpConnector::from_url(url)
            .map_err(|e| ClientError::InvalidArgument(format!("{}: {}", url, e)))?;
        Self::connect_with(Arc::new(connector), options).await
    }

    /// Connect through `connector`.
    ///
    /// Returns once the first session is established; a failed first attempt
    /// is returned here and leaves nothing running.
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
    ) -> Result<(Connection, ErrorStream)> {
        options.validate()?;

        let (errors_tx, errors_rx) = mpsc::channel(options.error_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                session: None,
                epoch: 0,
                dispatcher: None,
                reconnector: None,
                backoff: Backoff::new(options.reconnect_backoff_min, options.reconnect_backoff_max),
            }),
            registry: Registry::new(options.subscription_capacity),
            connector,
            options,
            state: state_tx,
            correlator: Correlator::new(),
            errors: errors_tx,
            login: StdMutex::new(None),
        });

        info!(endpoint = %inner.connector.describe(), "Connecting");
        inner.set_state(ConnectionState::Connecting);
        if let Err(e) = inner.attempt(0).await {
            warn!("Connection failed: {}", e);
            inner.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        Ok((Connection { inner }, ErrorStream { rx: errors_rx }))
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether a session is established
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Client id confirmed by the server at the last login
    pub fn client_id(&self) -> Option<String> {
        self.inner
            .login
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|info| info.client_id.clone())
    }

    /// Close the connection and every subscription stream
    pub async fn disconnect(&self) {
        let grace = self.inner.options.disconnect_grace;
        let (session, dispatcher, reconnector) = {
            let mut core = self.inner.core.lock().await;
            core.epoch += 1;
            core.backoff.reset();
            self.inner.set_state(ConnectionState::Disconnected);
            (
                core.session.take(),
                core.dispatcher.take(),
                core.reconnector.take(),
            )
        };

        if let Some(reconnector) = reconnector {
            reconnector.abort();
        }
        let summary = self.inner.correlator.drain_on_disconnect();
        if let Some(session) = session {
            session
                .close(StatusCode::Ok, "client disconnect", grace)
                .await;
        }
        if let Some(mut dispatcher) = dispatcher {
            if tokio::time::timeout(grace, &mut dispatcher).await.is_err() {
                warn!("Dispatcher still busy after {:?}, aborting", grace);
                dispatcher.abort();
            }
        }
        self.inner.registry.clear().await;

        info!(
            uncertain_publishes = summary.publishes,
            "Disconnected"
        );
    }

    /// Connect again now.
    ///
    /// No-op while connected. Cancels a pending backoff and replays every
    /// registered subscription on success.
    pub async fn reconnect(&self) -> Result<()> {
        let epoch = {
            let mut core = self.inner.core.lock().await;
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(ClientError::InvalidArgument(
                        "connection attempt already in progress".to_string(),
                    ))
                }
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            if let Some(reconnector) = core.reconnector.take() {
                reconnector.abort();
            }
            core.epoch += 1;
            core.backoff.reset();
            self.inner.set_state(ConnectionState::Connecting);
            core.epoch
        };

        match self.inner.attempt(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let core = self.inner.core.lock().await;
                if core.epoch == epoch {
                    self.inner.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Publish `message` and wait for the server's answer
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publish_async(message).await?.await.result
    }

    /// Queue `message` for publishing.
    ///
    /// Publishes are written in call order. The returned future resolves when
    /// the server answers, or with [`ClientError::PublishUncertain`] if the
    /// connection drops first.
    pub async fn publish_async(&self, message: Message) -> Result<PendingPublish> {
        let core = self.inner.core.lock().await;
        let session = self.inner.connected_session(&core)?;

        let request_id = self.inner.correlator.next_id();
        let bytes = Frame::Publish {
            req_id: request_id,
            message: message.clone(),
        }
        .encode(session.max_frame_size())?;

        let (request, rx) = PendingRequest::new(RequestKind::Publish);
        self.inner.correlator.register(request_id, request);
        if session.send_bytes(bytes).await.is_err() {
            self.inner.correlator.take(request_id);
            return Err(ClientError::NotConnected);
        }
        debug!(req_id = request_id, "Publish queued");

        Ok(PendingPublish {
            request_id,
            message: Some(message),
            rx,
        })
    }

    /// Subscribe with default options and wait until the server accepts
    pub async fn subscribe(&self, matcher: &str, durable: Option<&str>) -> Result<SubscriptionStream> {
        self.subscribe_with_options(matcher, durable, SubscriptionOptions::default())
            .await
    }

    /// Subscribe and wait until the server accepts.
    ///
    /// The `Subscribed` event is consumed; the returned stream starts with
    /// deliveries. Fails with [`ClientError::ConnectionLost`] if the engine
    /// ends up disconnected before the server answers; the subscription is
    /// then forgotten. A loss followed by a successful reconnect keeps
    /// waiting for the replayed subscription.
    pub async fn subscribe_with_options(
        &self,
        matcher: &str,
        durable: Option<&str>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionStream> {
        let mut stream = self.subscribe_async(matcher, durable, options).await?;
        let mut state = self.state_receiver();
        let disconnected = async {
            let _ = state
                .wait_for(|current| *current == ConnectionState::Disconnected)
                .await;
        };

        let event = tokio::select! {
            biased;
            event = stream.recv() => Some(event),
            _ = disconnected => None,
        };
        let Some(event) = event else {
            self.inner
                .registry
                .discard(stream.subscription().key())
                .await;
            return Err(ClientError::ConnectionLost);
        };
        match event {
            Some(SubscriptionEvent::Subscribed { .. }) => Ok(stream),
            Some(SubscriptionEvent::Failed(e)) => Err(e),
            Some(SubscriptionEvent::Message(_)) => Err(ClientError::Protocol(
                "delivery before subscription was acknowledged".to_string(),
            )),
            None => Err(ClientError::Shutdown),
        }
    }

    /// Register a subscription without waiting; its stream reports
    /// `Subscribed` or `Failed` first
    pub async fn subscribe_async(
        &self,
        matcher: &str,
        durable: Option<&str>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionStream> {
        let core = self.inner.core.lock().await;
        let session = self.inner.connected_session(&core)?;

        let stream = self.inner.registry.add(matcher, durable, options).await?;
        let subscription = stream.subscription();
        let req_id = self.inner.correlator.next_id();
        self.inner.correlator.register(
            req_id,
            PendingRequest::detached(RequestKind::Subscribe(subscription.key())),
        );
        if session
            .send(&subscription.subscribe_frame(req_id))
            .await
            .is_err()
        {
            // still pending in the registry; replayed by the next session
            self.inner.correlator.take(req_id);
        }
        debug!(req_id, key = subscription.key().as_u64(), "Subscribe sent");
        Ok(stream)
    }

    /// Remove a subscription and wait for the server to confirm
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.unsubscribe_key(subscription.key()).await
    }

    /// Remove every subscription
    pub async fn unsubscribe_all(&self) -> Result<()> {
        let mut first_error = None;
        for key in self.inner.registry.keys().await {
            match self.unsubscribe_key(key).await {
                Ok(()) | Err(ClientError::NotFound(_)) => {}
                Err(e) => {
                    warn!(key = key.as_u64(), "Unsubscribe failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn unsubscribe_key(&self, key: SubscriptionKey) -> Result<()> {
        let rx = {
            let core = self.inner.core.lock().await;
            let session = self.inner.connected_session(&core)?;
            let identity = match self.inner.registry.begin_remove(key).await? {
                Removal::Local => return Ok(()),
                Removal::Remote { identity } => identity,
            };

            let req_id = self.inner.correlator.next_id();
            let (request, rx) = PendingRequest::new(RequestKind::Unsubscribe(key));
            self.inner.correlator.register(req_id, request);
            if session
                .send(&Frame::Unsubscribe { req_id, identity })
                .await
                .is_err()
            {
                self.inner.correlator.take(req_id);
                return Err(ClientError::ConnectionLost);
            }
            rx
        };
        rx.await.unwrap_or(Err(ClientError::ConnectionLost))
    }

    /// Acknowledge one delivery of a client-ack subscription
    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        self.send_ack(delivery, false).await
    }

    /// Acknowledge a delivery and every earlier one on its subscription
    pub async fn acknowledge_all(&self, delivery: &Delivery) -> Result<()> {
        self.send_ack(delivery, true).await
    }

    async fn send_ack(&self, delivery: &Delivery, cumulative: bool) -> Result<()> {
        let token = delivery.ack_token().ok_or_else(|| {
            ClientError::InvalidArgument("delivery does not take acknowledgments".to_string())
        })?;

        let core = self.inner.core.lock().await;
        let session = self.inner.connected_session(&core)?;
        let frame = if cumulative {
            self.inner.registry.acknowledge_all(token).await?
        } else {
            self.inner.registry.acknowledge(token).await?
        };
        session
            .send(&frame)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn emit(&self, error: ClientError) {
        if let Err(mpsc::error::TrySendError::Full(error)) = self.errors.try_send(error) {
            warn!("Error stream full, dropping: {}", error);
        }
    }

    fn connected_session(&self, core: &Core) -> Result<Arc<Session>> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        core.session
            .clone()
            .filter(|session| !session.is_closed())
            .ok_or(ClientError::NotConnected)
    }

    /// Open a session and install it if `epoch` is still current
    async fn attempt(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let id_token = self
            .login
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|info| info.id_token.clone());

        let stream = self.connector.connect().await.map_err(|e| {
            ClientError::Transport(format!("{}: {}", self.connector.describe(), e))
        })?;
        let (session, inbound) = Session::open(stream, self.options.session_config(id_token)).await?;
        let session = Arc::new(session);

        let mut core = self.core.lock().await;
        let state = *self.state.borrow();
        let current = core.epoch == epoch
            && matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            );
        if !current {
            drop(core);
            debug!("Connection attempt superseded, discarding session");
            session
                .close(StatusCode::Ok, "superseded", self.options.disconnect_grace)
                .await;
            return Err(ClientError::Shutdown);
        }

        core.epoch += 1;
        let epoch = core.epoch;
        *self.login.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(session.info().clone());
        core.session = Some(session.clone());
        core.reconnector = None;
        core.backoff.reset();
        core.dispatcher = Some(tokio::spawn(dispatch(Arc::downgrade(self), epoch, inbound)));
        self.set_state(ConnectionState::Connected);

        // replayed before the lock is released so new requests follow them
        let plan = self.registry.replay_plan().await;
        if !plan.is_empty() {
            info!(count = plan.len(), "Replaying subscriptions");
        }
        for subscription in plan {
            let req_id = self.correlator.next_id();
            self.correlator.register(
                req_id,
                PendingRequest::detached(RequestKind::Subscribe(subscription.key())),
            );
            if let Err(e) = session.send(&subscription.subscribe_frame(req_id)).await {
                warn!("Subscription replay interrupted: {}", e);
                self.correlator.take(req_id);
                break;
            }
        }
        Ok(())
    }

    /// Send `frame` on the session of `epoch`, if it is still installed
    async fn send_on(&self, epoch: u64, frame: Frame) {
        let session = {
            let core = self.core.lock().await;
            if core.epoch != epoch {
                return;
            }
            core.session.clone()
        };
        if let Some(session) = session {
            if let Err(e) = session.send(&frame).await {
                debug!("Dropping {:?} frame: {}", frame.frame_type(), e);
            }
        }
    }

    async fn handle_frame(&self, epoch: u64, frame: Frame) {
        match frame {
            Frame::PublishAck { req_id } => {
                self.correlator.resolve(req_id, Ok(()));
            }
            Frame::PublishError {
                req_id,
                code,
                reason,
            }
            | Frame::SubscribeError {
                req_id,
                code,
                reason,
            } => {
                self.handle_rejection(req_id, ClientError::Rejected { code, reason })
                    .await;
            }
            Frame::SubscribeAck { req_id, identity } => {
                let key = match self.correlator.take(req_id) {
                    Some(PendingRequest {
                        kind: RequestKind::Subscribe(key),
                        ..
                    }) => key,
                    Some(request) => {
                        warn!(req_id, "Subscribe ack for a {:?} request", request.kind);
                        request.complete(Err(ClientError::Protocol(
                            "unexpected subscribe ack".to_string(),
                        )));
                        return;
                    }
                    None => {
                        debug!(req_id, "Subscribe ack for unknown request");
                        return;
                    }
                };
                match self.registry.on_subscribe_ack(key, identity.clone()).await {
                    SubscribeAckOutcome::Active(Some(notify)) => {
                        notify.send().await;
                    }
                    SubscribeAckOutcome::Active(None) => {}
                    SubscribeAckOutcome::Orphaned => {
                        debug!(%identity, "Removing subscription unsubscribed while pending");
                        let req_id = self.correlator.next_id();
                        self.correlator
                            .register(req_id, PendingRequest::detached(RequestKind::Unsubscribe(key)));
                        self.send_on(epoch, Frame::Unsubscribe { req_id, identity })
                            .await;
                    }
                }
            }
            Frame::UnsubscribeAck { req_id, identity } => match self.correlator.take(req_id) {
                Some(request) => {
                    if let RequestKind::Unsubscribe(key) = request.kind {
                        self.registry.finish_remove(key).await;
                    }
                    debug!(req_id, %identity, "Unsubscribed");
                    request.complete(Ok(()));
                }
                None => debug!(req_id, "Unsubscribe ack for unknown request"),
            },
            Frame::Deliver(deliver) => match self.registry.route(deliver).await {
                Some(Routed::Deliver { notify, auto_ack }) => {
                    if notify.send().await {
                        if let Some(ack) = auto_ack {
                            self.send_on(epoch, ack).await;
                        }
                    }
                }
                Some(Routed::Dropped { ack: Some(ack) }) => self.send_on(epoch, ack).await,
                Some(Routed::Dropped { ack: None }) | None => {}
            },
            Frame::Error { code, reason } => {
                warn!(%code, "Server error: {}", reason);
                self.emit(ClientError::Rejected { code, reason });
            }
            other => {
                warn!("Unexpected {:?} frame from server", other.frame_type());
            }
        }
    }

    async fn handle_rejection(&self, req_id: u64, error: ClientError) {
        let Some(request) = self.correlator.take(req_id) else {
            debug!(req_id, "Rejection for unknown request: {}", error);
            return;
        };
        match request.kind {
            RequestKind::Publish => request.complete(Err(error)),
            RequestKind::Subscribe(key) => {
                if let Some(notify) = self.registry.on_subscribe_error(key, error).await {
                    notify.send().await;
                }
            }
            RequestKind::Unsubscribe(key) => {
                self.registry.abort_remove(key).await;
                request.complete(Err(error));
            }
        }
    }

    /// Session of `epoch` ended
    async fn on_session_lost(self: &Arc<Self>, epoch: u64, reason: CloseReason) {
        let mut core = self.core.lock().await;
        if core.epoch != epoch || core.session.is_none() {
            debug!(%reason, "Stale session closed");
            return;
        }
        core.session = None;
        core.dispatcher = None;
        core.epoch += 1;

        let error = ClientError::from(reason);
        let summary = self.correlator.drain_on_disconnect();
        self.registry.on_disconnect().await;
        warn!(
            uncertain_publishes = summary.publishes,
            "Connection lost: {}", error
        );

        let fatal = error.is_fatal();
        self.emit(error);

        if self.options.auto_reconnect && !fatal && self.options.max_reconnect_attempts > 0 {
            self.set_state(ConnectionState::Reconnecting);
            core.reconnector = Some(tokio::spawn(reconnect_loop(
                Arc::downgrade(self),
                core.epoch,
            )));
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn give_up(&self, epoch: u64) {
        let mut core = self.core.lock().await;
        if core.epoch == epoch {
            core.reconnector = None;
            core.backoff.reset();
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

async fn dispatch(inner: Weak<Inner>, epoch: u64, mut inbound: SessionInbound) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_frame(epoch, frame).await;
    }

    let reason = inbound.closed().await;
    if let Some(inner) = inner.upgrade() {
        inner.on_session_lost(epoch, reason).await;
    }
}

fn reconnect_loop(
    inner: Weak<Inner>,
    epoch: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let (delay, attempt) = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut core = inner.core.lock().await;
                if core.epoch != epoch {
                    return;
                }
                if core.backoff.attempts() >= inner.options.max_reconnect_attempts {
                    warn!(
                        attempts = core.backoff.attempts(),
                        "Giving up reconnecting"
                    );
                    drop(core);
                    inner.give_up(epoch).await;
                    return;
                }
                let delay = core.backoff.next_delay();
                (delay, core.backoff.attempts())
            };

            info!(attempt, ?delay, "Reconnecting");
            tokio::time::sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner.attempt(epoch).await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(ClientError::Shutdown) => return,
                Err(e) => {
                    warn!(attempt, "Reconnect attempt failed: {}", e);
                    let fatal = e.is_fatal();
                    inner.emit(e);
                    if fatal {
                        inner.give_up(epoch).await;
                        return;
                    }
                }
            }
        }
    })
}
