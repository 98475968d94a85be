//! Subscription registry.
//!
//! Tracks every subscription the application created, independent of the
//! connection it currently lives on. Subscriptions move through
//! pending → active → closing; a connection loss demotes them back to
//! pending so the engine can replay them, in creation order, on the next
//! session.
//!
//! The registry never sends anything itself. Methods return the frames and
//! event notifications the engine must deliver, so no lock is held while a
//! bounded subscription queue applies backpressure.

use courier_wire::{AckMode, Deliver, DurableType, Frame, Message, Subscribe};
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};
use crate::matcher::Matcher;

/// Local identifier of a subscription, ordered by creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(u64);

impl SubscriptionKey {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw key value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Per-subscription options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// How deliveries are acknowledged
    pub ack_mode: AckMode,
    /// Durable behavior; only used with a durable name
    pub durable_type: DurableType,
}

impl SubscriptionOptions {
    /// Options with the given acknowledgment mode
    pub fn with_ack_mode(ack_mode: AckMode) -> Self {
        Self {
            ack_mode,
            ..Self::default()
        }
    }
}

/// Handle to a subscription created through the engine
#[derive(Debug, Clone)]
pub struct Subscription {
    key: SubscriptionKey,
    matcher: Matcher,
    durable: Option<String>,
    options: SubscriptionOptions,
}

impl Subscription {
    /// Local key
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// Content matcher
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Durable name, if any
    pub fn durable(&self) -> Option<&str> {
        self.durable.as_deref()
    }

    /// Subscription options
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub(crate) fn subscribe_frame(&self, req_id: u64) -> Frame {
        Frame::Subscribe(Subscribe {
            req_id,
            matcher: self.matcher.to_string(),
            durable: self.durable.clone(),
            durable_type: self.options.durable_type.clone(),
            ack_mode: self.options.ack_mode,
        })
    }
}

/// Token identifying one delivery for client acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    key: SubscriptionKey,
    generation: u64,
    token: u64,
}

impl AckToken {
    /// Server token value
    pub fn value(&self) -> u64 {
        self.token
    }
}

/// A message delivered to a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The message
    pub message: Message,
    /// Server sequence number, if provided
    pub sequence: Option<u64>,
    /// Whether the server delivered this message before
    pub redelivered: bool,
    ack: Option<AckToken>,
}

impl Delivery {
    /// Token to pass to acknowledge; only set in client ack mode
    pub fn ack_token(&self) -> Option<&AckToken> {
        self.ack.as_ref()
    }
}

/// Event on a subscription stream
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// Server accepted the subscription
    Subscribed {
        /// Server identity of the subscription
        identity: String,
    },
    /// Server rejected the subscription; the stream ends after this
    Failed(ClientError),
    /// A delivered message
    Message(Delivery),
}

/// Bounded event queue of one subscription
pub struct SubscriptionStream {
    subscription: Subscription,
    events: mpsc::Receiver<SubscriptionEvent>,
}

impl SubscriptionStream {
    /// The subscription this stream belongs to
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Next event; `None` once the subscription is gone
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

impl Stream for SubscriptionStream {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Event to push onto a subscription queue once the registry lock is released
#[derive(Debug)]
pub(crate) struct Notify {
    tx: mpsc::Sender<SubscriptionEvent>,
    event: SubscriptionEvent,
}

impl Notify {
    /// Push the event, waiting while the queue is full
    pub(crate) async fn send(self) -> bool {
        self.tx.send(self.event).await.is_ok()
    }
}

/// Result of routing a DELIVER frame
#[derive(Debug)]
pub(crate) enum Routed {
    /// Queue the delivery, then send `auto_ack` if present
    Deliver {
        notify: Notify,
        auto_ack: Option<Frame>,
    },
    /// Filtered out; send `ack` if present
    Dropped { ack: Option<Frame> },
}

/// Result of a SUBSCRIBE_ACK
#[derive(Debug)]
pub(crate) enum SubscribeAckOutcome {
    /// Subscription is active; notify the first time
    Active(Option<Notify>),
    /// Subscription was removed while pending; the server copy must go
    Orphaned,
}

/// How an unsubscribe proceeds
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Removal {
    /// Removed locally; nothing to send
    Local,
    /// Server identity to unsubscribe
    Remote { identity: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Pending,
    Active { identity: String },
    Closing { identity: String },
}

struct Entry {
    subscription: Subscription,
    events: mpsc::Sender<SubscriptionEvent>,
    phase: Phase,
    announced: bool,
    retained: BTreeSet<u64>,
}

impl Entry {
    fn identity(&self) -> Option<&str> {
        match &self.phase {
            Phase::Pending => None,
            Phase::Active { identity } | Phase::Closing { identity } => Some(identity),
        }
    }
}

#[derive(Default)]
struct State {
    next_key: u64,
    generation: u64,
    entries: BTreeMap<SubscriptionKey, Entry>,
    identities: HashMap<String, SubscriptionKey>,
}

impl State {
    fn remove(&mut self, key: SubscriptionKey) -> Option<Entry> {
        let entry = self.entries.remove(&key)?;
        if let Some(identity) = entry.identity() {
            self.identities.remove(identity);
        }
        Some(entry)
    }

    fn active_entry(&mut self, token: &AckToken) -> Result<&mut Entry> {
        if token.generation != self.generation {
            return Err(ClientError::NotFound(
                "acknowledgment token belongs to an earlier connection".to_string(),
            ));
        }
        match self.entries.get_mut(&token.key) {
            Some(entry) if matches!(entry.phase, Phase::Active { .. }) => Ok(entry),
            _ => Err(ClientError::NotFound(format!(
                "subscription {} is not active",
                token.key.as_u64()
            ))),
        }
    }
}

/// Subscription table shared by the engine and its dispatcher
pub(crate) struct Registry {
    state: RwLock<State>,
    capacity: usize,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            capacity: capacity.max(1),
        }
    }

    /// Create a pending subscription and its event stream
    pub(crate) async fn add(
        &self,
        matcher: &str,
        durable: Option<&str>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionStream> {
        let matcher = Matcher::parse(matcher)?;
        if let DurableType::LastValue { key } = &options.durable_type {
            if key.is_empty() {
                return Err(ClientError::InvalidArgument(
                    "last-value durable requires a key field".to_string(),
                ));
            }
        }

        let mut state = self.state.write().await;
        if let Some(name) = durable {
            if name.is_empty() {
                return Err(ClientError::InvalidArgument(
                    "durable name must not be empty".to_string(),
                ));
            }
            let taken = state.entries.values().any(|entry| {
                entry.subscription.durable() == Some(name)
                    && !matches!(entry.phase, Phase::Closing { .. })
            });
            if taken {
                return Err(ClientError::InvalidArgument(format!(
                    "durable {} is already subscribed",
                    name
                )));
            }
        }

        state.next_key += 1;
        let subscription = Subscription {
            key: SubscriptionKey::new(state.next_key),
            matcher,
            durable: durable.map(str::to_string),
            options,
        };
        let (tx, rx) = mpsc::channel(self.capacity);
        state.entries.insert(
            subscription.key,
            Entry {
                subscription: subscription.clone(),
                events: tx,
                phase: Phase::Pending,
                announced: false,
                retained: BTreeSet::new(),
            },
        );
        debug!(key = subscription.key.as_u64(), matcher = %subscription.matcher, "Subscription added");

        Ok(SubscriptionStream {
            subscription,
            events: rx,
        })
    }

    pub(crate) async fn on_subscribe_ack(
        &self,
        key: SubscriptionKey,
        identity: String,
    ) -> SubscribeAckOutcome {
        let mut state = self.state.write().await;
        let Some(entry) = state.entries.get_mut(&key) else {
            return SubscribeAckOutcome::Orphaned;
        };
        if entry.phase != Phase::Pending {
            warn!(key = key.as_u64(), %identity, "Subscribe ack for a subscription that is not pending");
            return SubscribeAckOutcome::Active(None);
        }

        entry.phase = Phase::Active {
            identity: identity.clone(),
        };
        let notify = if entry.announced {
            None
        } else {
            entry.announced = true;
            Some(Notify {
                tx: entry.events.clone(),
                event: SubscriptionEvent::Subscribed {
                    identity: identity.clone(),
                },
            })
        };
        debug!(key = key.as_u64(), %identity, "Subscription active");
        state.identities.insert(identity, key);
        SubscribeAckOutcome::Active(notify)
    }

    /// Remove a subscription the server refused
    pub(crate) async fn on_subscribe_error(
        &self,
        key: SubscriptionKey,
        error: ClientError,
    ) -> Option<Notify> {
        let entry = self.state.write().await.remove(key)?;
        debug!(key = key.as_u64(), "Subscription refused: {}", error);
        Some(Notify {
            tx: entry.events,
            event: SubscriptionEvent::Failed(error),
        })
    }

    /// Match a delivery to its subscription
    pub(crate) async fn route(&self, deliver: Deliver) -> Option<Routed> {
        let mut state = self.state.write().await;
        let generation = state.generation;
        let Some(key) = state.identities.get(&deliver.identity).copied() else {
            debug!(identity = %deliver.identity, "Delivery for unknown subscription");
            return None;
        };
        let entry = state.entries.get_mut(&key)?;
        if !matches!(entry.phase, Phase::Active { .. }) {
            trace!(identity = %deliver.identity, "Delivery for closing subscription dropped");
            return None;
        }

        let ack_mode = entry.subscription.options.ack_mode;
        let ack_frame = |token: u64| Frame::Acknowledge {
            identity: deliver.identity.clone(),
            token,
            cumulative: false,
        };

        if !entry.subscription.matcher.matches(&deliver.message) {
            trace!(identity = %deliver.identity, "Delivery does not match, dropping");
            let ack = match ack_mode {
                AckMode::None => None,
                AckMode::Auto | AckMode::Client => deliver.ack_token.map(ack_frame),
            };
            return Some(Routed::Dropped { ack });
        }

        let (ack, auto_ack) = match (ack_mode, deliver.ack_token) {
            (AckMode::Client, Some(token)) => {
                entry.retained.insert(token);
                let ack = AckToken {
                    key,
                    generation,
                    token,
                };
                (Some(ack), None)
            }
            (AckMode::Auto, Some(token)) => (None, Some(ack_frame(token))),
            _ => (None, None),
        };

        let delivery = Delivery {
            message: deliver.message,
            sequence: deliver.sequence,
            redelivered: deliver.redelivered,
            ack,
        };
        Some(Routed::Deliver {
            notify: Notify {
                tx: entry.events.clone(),
                event: SubscriptionEvent::Message(delivery),
            },
            auto_ack,
        })
    }

    /// Acknowledge one retained delivery
    pub(crate) async fn acknowledge(&self, token: &AckToken) -> Result<Frame> {
        let mut state = self.state.write().await;
        let entry = state.active_entry(token)?;
        if !entry.retained.remove(&token.token) {
            return Err(ClientError::NotFound(format!(
                "delivery {} already acknowledged",
                token.token
            )));
        }
        Ok(Frame::Acknowledge {
            identity: entry.identity().unwrap_or_default().to_string(),
            token: token.token,
            cumulative: false,
        })
    }

    /// Acknowledge every retained delivery up to and including `token`
    pub(crate) async fn acknowledge_all(&self, token: &AckToken) -> Result<Frame> {
        let mut state = self.state.write().await;
        let entry = state.active_entry(token)?;
        if !entry.retained.contains(&token.token) {
            return Err(ClientError::NotFound(format!(
                "delivery {} already acknowledged",
                token.token
            )));
        }
        entry.retained = match token.token.checked_add(1) {
            Some(next) => entry.retained.split_off(&next),
            None => BTreeSet::new(),
        };
        Ok(Frame::Acknowledge {
            identity: entry.identity().unwrap_or_default().to_string(),
            token: token.token,
            cumulative: true,
        })
    }

    /// Start removing a subscription
    pub(crate) async fn begin_remove(&self, key: SubscriptionKey) -> Result<Removal> {
        let mut state = self.state.write().await;
        let phase = match state.entries.get(&key) {
            Some(entry) => entry.phase.clone(),
            None => return Err(not_found(key)),
        };
        match phase {
            Phase::Pending => {
                state.remove(key);
                debug!(key = key.as_u64(), "Pending subscription removed");
                Ok(Removal::Local)
            }
            Phase::Active { identity } => {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.phase = Phase::Closing {
                        identity: identity.clone(),
                    };
                }
                Ok(Removal::Remote { identity })
            }
            Phase::Closing { .. } => Err(not_found(key)),
        }
    }

    /// Server confirmed the unsubscribe; closes the stream
    pub(crate) async fn finish_remove(&self, key: SubscriptionKey) {
        if self.state.write().await.remove(key).is_some() {
            debug!(key = key.as_u64(), "Subscription removed");
        }
    }

    /// Server refused the unsubscribe; the subscription stays active
    pub(crate) async fn abort_remove(&self, key: SubscriptionKey) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.entries.get_mut(&key) {
            if let Phase::Closing { identity } = &entry.phase {
                entry.phase = Phase::Active {
                    identity: identity.clone(),
                };
            }
        }
    }

    /// Keys of every live subscription, in creation order
    pub(crate) async fn keys(&self) -> Vec<SubscriptionKey> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| !matches!(entry.phase, Phase::Closing { .. }))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Subscriptions to re-issue on a new session, in creation order
    pub(crate) async fn replay_plan(&self) -> Vec<Subscription> {
        let state = self.state.read().await;
        state
            .entries
            .values()
            .filter(|entry| entry.phase == Phase::Pending)
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    /// Forget everything tied to the lost session
    pub(crate) async fn on_disconnect(&self) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.identities.clear();
        state
            .entries
            .retain(|_, entry| !matches!(entry.phase, Phase::Closing { .. }));
        for entry in state.entries.values_mut() {
            entry.phase = Phase::Pending;
            entry.retained.clear();
        }
    }

    /// Drop every subscription, ending all streams
    pub(crate) async fn clear(&self) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.identities.clear();
        state.entries.clear();
    }

    /// Drop a subscription whatever its phase, ending its stream
    pub(crate) async fn discard(&self, key: SubscriptionKey) {
        if self.state.write().await.remove(key).is_some() {
            debug!(key = key.as_u64(), "Subscription discarded");
        }
    }

    /// Number of subscriptions, closing ones included
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

fn not_found(key: SubscriptionKey) -> ClientError {
    ClientError::NotFound(format!("subscription {}", key.as_u64()))
}
