//! Prometheus metrics for EdgeMQ
//!
//! Exposes publish outcomes, fan-out volume, drops and subscription counts
//! at the /metrics endpoint.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

mod server;

pub use server::MetricsServer;

/// All EdgeMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Publish metrics
    pub publish_messages_received: IntCounter,
    pub publish_bytes_received: IntCounter,
    pub publish_outcomes_total: IntCounterVec,
    pub publish_latency: Histogram,

    // Fan-out metrics
    pub messages_delivered_total: IntCounter,
    pub messages_queued_total: IntCounter,
    pub messages_dropped_total: IntCounterVec,
    pub shared_groups_skipped_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,
    pub shared_groups_current: IntGauge,

    // Retained messages
    pub retained_updates_total: IntCounterVec,
    pub retained_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let publish_messages_received = IntCounter::with_opts(Opts::new(
            "edgemq_publish_messages_received_total",
            "Total publish messages handed to the orchestrator",
        ))
        .unwrap();

        let publish_bytes_received = IntCounter::with_opts(Opts::new(
            "edgemq_publish_bytes_received_total",
            "Total payload bytes of received publish messages",
        ))
        .unwrap();

        let publish_outcomes_total = IntCounterVec::new(
            Opts::new(
                "edgemq_publish_outcomes_total",
                "Publish results by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "edgemq_publish_latency_seconds",
                "Time to match and fan out a publish message",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();

        let messages_delivered_total = IntCounter::with_opts(Opts::new(
            "edgemq_messages_delivered_total",
            "Recipient copies handed to a live delivery channel",
        ))
        .unwrap();

        let messages_queued_total = IntCounter::with_opts(Opts::new(
            "edgemq_messages_queued_total",
            "Recipient copies parked for offline sessions",
        ))
        .unwrap();

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "edgemq_messages_dropped_total",
                "Recipient copies that could not be delivered, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let shared_groups_skipped_total = IntCounter::with_opts(Opts::new(
            "edgemq_shared_groups_skipped_total",
            "Shared group deliveries skipped because no member was connected",
        ))
        .unwrap();

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "edgemq_subscriptions_current",
            "Current number of subscriptions",
        ))
        .unwrap();

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "edgemq_subscriptions_total",
            "Total subscriptions created since startup",
        ))
        .unwrap();

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "edgemq_unsubscriptions_total",
            "Total subscriptions removed since startup",
        ))
        .unwrap();

        let shared_groups_current = IntGauge::with_opts(Opts::new(
            "edgemq_shared_groups_current",
            "Current number of shared subscription groups",
        ))
        .unwrap();

        let retained_updates_total = IntCounterVec::new(
            Opts::new(
                "edgemq_retained_updates_total",
                "Retained store updates by operation",
            ),
            &["op"],
        )
        .unwrap();

        let retained_errors_total = IntCounter::with_opts(Opts::new(
            "edgemq_retained_errors_total",
            "Retained store updates that failed",
        ))
        .unwrap();

        registry
            .register(Box::new(publish_messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_bytes_received.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_outcomes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_delivered_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_queued_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(shared_groups_skipped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(unsubscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(shared_groups_current.clone()))
            .unwrap();
        registry
            .register(Box::new(retained_updates_total.clone()))
            .unwrap();
        registry
            .register(Box::new(retained_errors_total.clone()))
            .unwrap();

        Metrics {
            registry,
            publish_messages_received,
            publish_bytes_received,
            publish_outcomes_total,
            publish_latency,
            messages_delivered_total,
            messages_queued_total,
            messages_dropped_total,
            shared_groups_skipped_total,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            shared_groups_current,
            retained_updates_total,
            retained_errors_total,
        }
    }

    // Helper methods for common operations

    pub fn publish_received(&self, bytes: usize) {
        self.publish_messages_received.inc();
        self.publish_bytes_received.inc_by(bytes as u64);
    }

    pub fn publish_completed(&self, outcome: &str, elapsed_secs: f64) {
        self.publish_outcomes_total
            .with_label_values(&[outcome])
            .inc();
        self.publish_latency.observe(elapsed_secs);
    }

    pub fn message_dropped(&self, reason: &str) {
        self.messages_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_total.inc();
        self.subscriptions_current.inc();
    }

    pub fn subscriptions_removed(&self, count: usize) {
        self.unsubscriptions_total.inc_by(count as u64);
        self.subscriptions_current.sub(count as i64);
    }

    pub fn retained_updated(&self, op: &str) {
        self.retained_updates_total.with_label_values(&[op]).inc();
    }

    /// Encode every registered metric in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
