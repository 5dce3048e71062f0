//! Hooks module tests

use parking_lot::Mutex;

use super::*;
use crate::protocol::QoS;

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<(DropReason, String, Option<String>)>>,
}

impl DroppedMessageSink for RecordingSink {
    fn record(&self, reason: DropReason, message: &PublishMessage, client_id: Option<&str>) {
        self.seen.lock().push((
            reason,
            message.topic.to_string(),
            client_id.map(str::to_string),
        ));
    }
}

fn message() -> PublishMessage {
    PublishMessage::new("sensors/temp", "21.5", QoS::AtLeastOnce)
}

#[test]
fn test_drop_reason_from_delivery_error() {
    assert_eq!(
        DropReason::from(&DeliveryError::ChannelClosed),
        DropReason::ChannelClosed
    );
    assert_eq!(DropReason::from(&DeliveryError::QueueFull), DropReason::QueueFull);
    assert_eq!(DropReason::from(&DeliveryError::Timeout), DropReason::Timeout);
    assert_eq!(
        DropReason::from(&DeliveryError::Other("io".into())),
        DropReason::Other
    );
    assert_eq!(DropReason::QueueFull.to_string(), "queue_full");
}

#[test]
fn test_composite_forwards_to_all_sinks() {
    let first = Arc::new(RecordingSink::default());
    let second = Arc::new(RecordingSink::default());
    let composite = CompositeSink::new()
        .with(first.clone())
        .with(second.clone())
        .with(NoopSink);
    assert_eq!(composite.len(), 3);

    composite.record(DropReason::Timeout, &message(), Some("c1"));

    for sink in [&first, &second] {
        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            (
                DropReason::Timeout,
                "sensors/temp".to_string(),
                Some("c1".to_string())
            )
        );
    }
}

#[test]
fn test_empty_composite() {
    let composite = CompositeSink::default();
    assert!(composite.is_empty());
    composite.record(DropReason::Other, &message(), None);
}

#[test]
fn test_logging_sink_counts_by_reason() {
    let metrics = Arc::new(Metrics::new());
    let sink = LoggingSink::with_metrics(metrics.clone());

    sink.record(DropReason::QueueFull, &message(), Some("c1"));
    sink.record(DropReason::QueueFull, &message(), Some("c2"));
    sink.record(DropReason::NoSession, &message(), None);

    let count = |reason: &str| {
        metrics
            .messages_dropped_total
            .with_label_values(&[reason])
            .get()
    };
    assert_eq!(count("queue_full"), 2);
    assert_eq!(count("no_session"), 1);
    assert_eq!(count("timeout"), 0);
}
