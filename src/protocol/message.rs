//! Publish message as seen by the fan-out path

use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;

use super::QoS;

/// An inbound publish, or a per-recipient copy of one.
///
/// Topic and payload are reference counted, so producing a copy for every
/// recipient only bumps counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    /// Topic name (never contains wildcards)
    pub topic: Arc<str>,
    /// Payload
    pub payload: Bytes,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Client that published the message (None for broker-internal publishes)
    pub sender: Option<Arc<str>>,
    /// Subscription identifiers of the matching subscriptions (recipient copies only)
    pub subscription_ids: SmallVec<[u32; 4]>,
}

impl PublishMessage {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            sender: None,
            subscription_ids: SmallVec::new(),
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<Arc<str>>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Build the copy handed to one recipient.
    ///
    /// The duplicate flag is always cleared: a fresh fan-out is never a
    /// redelivery from the recipient's point of view.
    pub fn recipient_copy(&self, qos: QoS, retain: bool, subscription_ids: &[u32]) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos,
            retain,
            dup: false,
            sender: self.sender.clone(),
            subscription_ids: SmallVec::from_slice(subscription_ids),
        }
    }

    /// Whether a retained publish asks for the retained entry to be cleared
    pub fn clears_retained(&self) -> bool {
        self.retain && self.payload.is_empty()
    }

    pub fn is_from(&self, client_id: &str) -> bool {
        self.sender.as_deref() == Some(client_id)
    }
}
