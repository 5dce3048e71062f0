//! Hooks Module
//!
//! Observation points on the fan-out path. The router reports every
//! recipient copy it fails to hand off to a [`DroppedMessageSink`]; the
//! sinks here log and count them, and can be chained with
//! [`CompositeSink`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::protocol::PublishMessage;
use crate::session::DeliveryError;

#[cfg(test)]
mod tests;

/// Why a recipient copy was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Connection channel is closed
    ChannelClosed,
    /// Outbound or offline queue overflowed
    QueueFull,
    /// Hand-off exceeded the delivery timeout
    Timeout,
    /// Subscriber has neither a live channel nor a persistent session
    NoSession,
    /// The channel failed or panicked for some other reason
    Other,
}

impl DropReason {
    /// Stable label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::ChannelClosed => "channel_closed",
            DropReason::QueueFull => "queue_full",
            DropReason::Timeout => "timeout",
            DropReason::NoSession => "no_session",
            DropReason::Other => "other",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&DeliveryError> for DropReason {
    fn from(err: &DeliveryError) -> Self {
        match err {
            DeliveryError::ChannelClosed => DropReason::ChannelClosed,
            DeliveryError::QueueFull => DropReason::QueueFull,
            DeliveryError::Timeout => DropReason::Timeout,
            DeliveryError::Other(_) => DropReason::Other,
        }
    }
}

/// Receives recipient copies that could not be delivered
///
/// Called from inside the fan-out futures, so implementations must not
/// block.
pub trait DroppedMessageSink: Send + Sync {
    fn record(&self, reason: DropReason, message: &PublishMessage, client_id: Option<&str>);
}

/// Implement DroppedMessageSink for Arc<T> where T: DroppedMessageSink
impl<T: DroppedMessageSink + ?Sized> DroppedMessageSink for Arc<T> {
    fn record(&self, reason: DropReason, message: &PublishMessage, client_id: Option<&str>) {
        (**self).record(reason, message, client_id);
    }
}

/// Sink that ignores everything
#[derive(Debug, Default)]
pub struct NoopSink;

impl DroppedMessageSink for NoopSink {
    fn record(&self, _reason: DropReason, _message: &PublishMessage, _client_id: Option<&str>) {}
}

/// Sink that logs drops and counts them per reason
#[derive(Default)]
pub struct LoggingSink {
    metrics: Option<Arc<Metrics>>,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }
}

impl DroppedMessageSink for LoggingSink {
    fn record(&self, reason: DropReason, message: &PublishMessage, client_id: Option<&str>) {
        let client_id = client_id.unwrap_or("-");
        match reason {
            // Expected when a clean session subscribes and goes away
            DropReason::NoSession => debug!(
                client_id,
                topic = %message.topic,
                reason = reason.as_str(),
                "message dropped"
            ),
            _ => warn!(
                client_id,
                topic = %message.topic,
                qos = message.qos.as_u8(),
                reason = reason.as_str(),
                "message dropped"
            ),
        }

        if let Some(ref metrics) = self.metrics {
            metrics.message_dropped(reason.as_str());
        }
    }
}

/// Composite sink that forwards every drop to each inner sink in order
pub struct CompositeSink {
    sinks: Vec<Box<dyn DroppedMessageSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink
    pub fn add<S: DroppedMessageSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    /// Add a sink and return self for chaining
    pub fn with<S: DroppedMessageSink + 'static>(mut self, sink: S) -> Self {
        self.add(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Default for CompositeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DroppedMessageSink for CompositeSink {
    fn record(&self, reason: DropReason, message: &PublishMessage, client_id: Option<&str>) {
        for sink in &self.sinks {
            sink.record(reason, message, client_id);
        }
    }
}
