//! Request id allocation and completion routing.
//!
//! Every outbound request that expects an answer gets an id from
//! [`Correlator::next_id`] and a [`PendingRequest`] entry. The dispatcher
//! resolves the entry when the matching ack or error arrives; a connection
//! loss drains whatever is left.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;
use crate::registry::SubscriptionKey;

/// Outcome delivered to whoever waits on a request
pub type RequestResult = Result<(), ClientError>;

/// What a pending request was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// PUBLISH awaiting its ack
    Publish,
    /// SUBSCRIBE awaiting its ack
    Subscribe(SubscriptionKey),
    /// UNSUBSCRIBE awaiting its ack
    Unsubscribe(SubscriptionKey),
}

/// A request awaiting its answer
#[derive(Debug)]
pub struct PendingRequest {
    /// Request kind
    pub kind: RequestKind,
    sink: Option<oneshot::Sender<RequestResult>>,
}

impl PendingRequest {
    /// Pending request with a waiter; returns the receiving end
    pub fn new(kind: RequestKind) -> (Self, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { kind, sink: Some(tx) }, rx)
    }

    /// Pending request nobody waits on
    pub fn detached(kind: RequestKind) -> Self {
        Self { kind, sink: None }
    }

    /// Deliver the outcome to the waiter, if any
    pub fn complete(self, result: RequestResult) {
        if let Some(sink) = self.sink {
            let _ = sink.send(result);
        }
    }
}

/// Pending requests left behind by a connection loss
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    /// Publishes resolved as uncertain
    pub publishes: usize,
    /// Subscribes dropped; the registry replays them
    pub subscribes: usize,
    /// Unsubscribes resolved as connection lost
    pub unsubscribes: usize,
}

/// Request id allocator and pending-request table
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Empty correlator; the first id is 1
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocate a request id; ids are never reused
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a request until its answer arrives
    pub fn register(&self, id: u64, request: PendingRequest) {
        self.pending.insert(id, request);
    }

    /// Remove and return a pending request
    pub fn take(&self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id).map(|(_, request)| request)
    }

    /// Deliver the outcome of request `id` once; unknown ids are ignored
    pub fn resolve(&self, id: u64, result: RequestResult) -> bool {
        match self.take(id) {
            Some(request) => {
                request.complete(result);
                true
            }
            None => {
                debug!(req_id = id, "Ignoring answer for unknown request");
                false
            }
        }
    }

    /// Settle every pending request after a connection loss
    pub fn drain_on_disconnect(&self) -> DrainSummary {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut summary = DrainSummary::default();

        for id in ids {
            let Some(request) = self.take(id) else {
                continue;
            };
            match request.kind {
                RequestKind::Publish => {
                    summary.publishes += 1;
                    request.complete(Err(ClientError::PublishUncertain));
                }
                RequestKind::Subscribe(_) => {
                    // the registry still holds the subscription and replays it
                    summary.subscribes += 1;
                }
                RequestKind::Unsubscribe(_) => {
                    summary.unsubscribes += 1;
                    request.complete(Err(ClientError::ConnectionLost));
                }
            }
        }
        summary
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let correlator = Correlator::new();
        assert_eq!(correlator.next_id(), 1);
        assert_eq!(correlator.next_id(), 2);
        assert_eq!(correlator.next_id(), 3);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let correlator = Arc::new(Correlator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let correlator = correlator.clone();
                std::thread::spawn(move || (0..1000).map(|_| correlator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let (request, rx) = PendingRequest::new(RequestKind::Publish);
        correlator.register(id, request);

        assert!(correlator.resolve(id, Ok(())));
        assert!(!correlator.resolve(id, Err(ClientError::PublishUncertain)));
        assert!(rx.await.unwrap().is_ok());
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(42, Ok(())));
        assert!(correlator.take(42).is_none());
    }

    #[tokio::test]
    async fn test_drain_on_disconnect() {
        let correlator = Correlator::new();
        let key = SubscriptionKey::new(1);

        let (publish, publish_rx) = PendingRequest::new(RequestKind::Publish);
        correlator.register(correlator.next_id(), publish);
        let (subscribe, mut subscribe_rx) = PendingRequest::new(RequestKind::Subscribe(key));
        correlator.register(correlator.next_id(), subscribe);
        let (unsubscribe, unsubscribe_rx) = PendingRequest::new(RequestKind::Unsubscribe(key));
        correlator.register(correlator.next_id(), unsubscribe);

        let summary = correlator.drain_on_disconnect();
        assert_eq!(
            summary,
            DrainSummary {
                publishes: 1,
                subscribes: 1,
                unsubscribes: 1
            }
        );
        assert!(correlator.is_empty());

        assert!(matches!(publish_rx.await.unwrap(), Err(ClientError::PublishUncertain)));
        assert!(matches!(unsubscribe_rx.await.unwrap(), Err(ClientError::ConnectionLost)));
        // dropped without an answer
        assert!(subscribe_rx.try_recv().is_err());

        // ids keep increasing after a drain
        assert_eq!(correlator.next_id(), 4);
    }
}
