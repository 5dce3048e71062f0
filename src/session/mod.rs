//! Session delivery plumbing
//!
//! The fan-out path only needs two things from sessions: a way to find the
//! live delivery channel of a client, and a place to park messages for
//! clients that are currently offline. Both are expressed as traits so
//! the transport layer can plug in its own connection writers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::PublishMessage;

/// Error returned when a message could not be handed to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The channel has been closed by the connection task
    ChannelClosed,
    /// Outbound buffer is full
    QueueFull,
    /// The hand-off did not complete within the configured deadline
    Timeout,
    /// Any other channel failure
    Other(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "delivery channel closed"),
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::Timeout => write!(f, "delivery timed out"),
            Self::Other(e) => write!(f, "delivery failed: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Result of parking a message for an offline client
#[derive(Debug)]
pub enum QueueResult {
    /// Message was queued
    Queued,
    /// Message was queued but the queue was full; the oldest entry was evicted
    DroppedOldest(PublishMessage),
    /// The client has no persistent session, nothing was queued
    NoSession,
}

/// Per-client outbound channel
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Hand a message to the client's connection
    async fn deliver(&self, message: PublishMessage) -> Result<(), DeliveryError>;

    /// Whether the underlying connection can still accept messages
    fn is_live(&self) -> bool {
        true
    }
}

/// Lookup of live channels and offline queues by client identifier
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Live delivery channel for a client, if connected
    fn channel(&self, client_id: &str) -> Option<Arc<dyn DeliveryChannel>>;

    /// Park a message for a client that has no live channel
    async fn enqueue_offline(
        &self,
        client_id: &str,
        message: PublishMessage,
    ) -> Result<QueueResult, DeliveryError>;
}

#[async_trait]
impl<T: SessionRegistry + ?Sized> SessionRegistry for Arc<T> {
    fn channel(&self, client_id: &str) -> Option<Arc<dyn DeliveryChannel>> {
        (**self).channel(client_id)
    }

    async fn enqueue_offline(
        &self,
        client_id: &str,
        message: PublishMessage,
    ) -> Result<QueueResult, DeliveryError> {
        (**self).enqueue_offline(client_id, message).await
    }
}

/// Delivery channel backed by a bounded tokio mpsc queue.
///
/// The hand-off never waits: a full buffer is reported as
/// [`DeliveryError::QueueFull`] so one slow reader cannot stall fan-out.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<PublishMessage>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<PublishMessage>) -> Self {
        Self { tx }
    }

    /// Create a writer together with the receiving half
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PublishMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl DeliveryChannel for ChannelWriter {
    async fn deliver(&self, message: PublishMessage) -> Result<(), DeliveryError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
        })
    }

    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Offline message queue of a persistent session
struct OfflineQueue {
    messages: VecDeque<PublishMessage>,
    limit: usize,
}

impl OfflineQueue {
    fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    fn push(&mut self, message: PublishMessage) -> QueueResult {
        let evicted = if self.limit > 0 && self.messages.len() >= self.limit {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        match evicted {
            Some(old) => QueueResult::DroppedOldest(old),
            None => QueueResult::Queued,
        }
    }
}

/// In-process session registry
pub struct LocalSessionRegistry {
    live: DashMap<Arc<str>, Arc<dyn DeliveryChannel>>,
    /// Offline queues, present only for persistent sessions
    offline: DashMap<Arc<str>, Mutex<OfflineQueue>>,
    max_queued_messages: usize,
}

impl LocalSessionRegistry {
    /// Create a registry; `max_queued_messages` of 0 means unbounded
    pub fn new(max_queued_messages: usize) -> Self {
        Self {
            live: DashMap::new(),
            offline: DashMap::new(),
            max_queued_messages,
        }
    }

    /// Attach a live channel for a client.
    ///
    /// A non-persistent registration discards any queue left over from an
    /// earlier persistent session.
    pub fn register(
        &self,
        client_id: impl Into<Arc<str>>,
        channel: Arc<dyn DeliveryChannel>,
        persistent: bool,
    ) {
        let client_id = client_id.into();
        if persistent {
            self.offline
                .entry(client_id.clone())
                .or_insert_with(|| Mutex::new(OfflineQueue::new(self.max_queued_messages)));
        } else if self.offline.remove(&client_id).is_some() {
            debug!(client_id = %client_id, "discarded offline queue on clean start");
        }
        self.live.insert(client_id, channel);
    }

    /// Detach the live channel; a persistent session keeps its queue
    pub fn unregister(&self, client_id: &str) -> bool {
        self.live.remove(client_id).is_some()
    }

    /// Forget a session completely
    pub fn end_session(&self, client_id: &str) {
        self.live.remove(client_id);
        self.offline.remove(client_id);
    }

    /// Take everything queued while the client was away
    pub fn drain_offline(&self, client_id: &str) -> VecDeque<PublishMessage> {
        self.offline
            .get(client_id)
            .map(|queue| std::mem::take(&mut queue.lock().messages))
            .unwrap_or_default()
    }

    pub fn offline_len(&self, client_id: &str) -> usize {
        self.offline
            .get(client_id)
            .map(|queue| queue.lock().messages.len())
            .unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[async_trait]
impl SessionRegistry for LocalSessionRegistry {
    fn channel(&self, client_id: &str) -> Option<Arc<dyn DeliveryChannel>> {
        self.live.get(client_id).map(|c| c.value().clone())
    }

    async fn enqueue_offline(
        &self,
        client_id: &str,
        message: PublishMessage,
    ) -> Result<QueueResult, DeliveryError> {
        let Some(queue) = self.offline.get(client_id) else {
            trace!(client_id, "no persistent session, not queueing");
            return Ok(QueueResult::NoSession);
        };
        let result = queue.lock().push(message);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn msg(topic: &str) -> PublishMessage {
        PublishMessage::new(topic, "x", QoS::AtLeastOnce)
    }

    #[tokio::test]
    async fn test_channel_writer_reports_full_and_closed() {
        let (writer, mut rx) = ChannelWriter::channel(1);
        assert!(writer.is_live());

        writer.deliver(msg("a")).await.unwrap();
        assert_eq!(writer.deliver(msg("b")).await, Err(DeliveryError::QueueFull));
        assert_eq!(&*rx.recv().await.unwrap().topic, "a");

        drop(rx);
        assert!(!writer.is_live());
        assert_eq!(
            writer.deliver(msg("c")).await,
            Err(DeliveryError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_offline_queue_drops_oldest() {
        let registry = LocalSessionRegistry::new(2);
        let (writer, _rx) = ChannelWriter::channel(4);
        registry.register("c1", Arc::new(writer), true);
        assert!(registry.unregister("c1"));
        assert!(registry.channel("c1").is_none());

        for topic in ["t/1", "t/2"] {
            let result = registry.enqueue_offline("c1", msg(topic)).await.unwrap();
            assert!(matches!(result, QueueResult::Queued));
        }
        match registry.enqueue_offline("c1", msg("t/3")).await.unwrap() {
            QueueResult::DroppedOldest(old) => assert_eq!(&*old.topic, "t/1"),
            other => panic!("expected eviction, got {:?}", other),
        }

        let drained: Vec<_> = registry
            .drain_offline("c1")
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        assert_eq!(drained, vec!["t/2", "t/3"]);
        assert_eq!(registry.offline_len("c1"), 0);
    }

    #[tokio::test]
    async fn test_clean_session_is_not_queued() {
        let registry = LocalSessionRegistry::new(10);
        let (writer, _rx) = ChannelWriter::channel(4);
        registry.register("c1", Arc::new(writer.clone()), true);
        registry.enqueue_offline("c1", msg("t")).await.unwrap();

        registry.register("c1", Arc::new(writer), false);
        assert_eq!(registry.offline_len("c1"), 0);
        registry.unregister("c1");

        let result = registry.enqueue_offline("c1", msg("t")).await.unwrap();
        assert!(matches!(result, QueueResult::NoSession));
        assert_eq!(registry.live_count(), 0);
    }
}
