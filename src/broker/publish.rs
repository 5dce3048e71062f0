//! Publish orchestration
//!
//! One pass per inbound publish: look up matches, kick off retained
//! bookkeeping, resolve recipients and fan out. Only a malformed publish
//! changes the outcome; everything that goes wrong during dispatch is
//! logged and absorbed.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::router::{DistributionReport, Recipient};
use super::{Broker, DispatchContext};
use crate::protocol::PublishMessage;
use crate::topic::{validate_topic_name_with_max_levels, MatchedSubscriber};

/// Result of a publish call as seen by the invoking layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Dispatch was attempted for at least one match
    Delivered,
    /// Nothing subscribes to the topic
    NoMatchingSubscribers,
    /// The publish itself was invalid
    Failed,
}

impl PublishOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishOutcome::Delivered => "delivered",
            PublishOutcome::NoMatchingSubscribers => "no_matching_subscribers",
            PublishOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drop self-deliveries suppressed by no-local and cap QoS at the publish QoS
pub(crate) fn resolve_recipients(
    message: &PublishMessage,
    subscribers: &[MatchedSubscriber],
) -> Vec<Recipient> {
    subscribers
        .iter()
        .filter(|sub| !(sub.no_local() && message.is_from(&sub.client_id)))
        .map(|sub| Recipient {
            client_id: sub.client_id.clone(),
            qos: message.qos.min(sub.qos),
            retain: message.retain && sub.retain_as_published(),
            subscription_ids: sub.subscription_ids.clone(),
        })
        .collect()
}

impl Broker {
    /// Match and fan out one publish.
    ///
    /// Returns once every recipient hand-off has been started. A retained
    /// update started for a topic without subscribers keeps running after
    /// this returns.
    pub async fn publish(&self, message: PublishMessage, ctx: &DispatchContext) -> PublishOutcome {
        let started = Instant::now();
        let outcome = self.dispatch(message, ctx).await;

        if let Some(ref metrics) = self.metrics {
            metrics.publish_completed(outcome.as_str(), started.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn dispatch(&self, message: PublishMessage, ctx: &DispatchContext) -> PublishOutcome {
        if let Err(reason) =
            validate_topic_name_with_max_levels(&message.topic, self.config.max_topic_levels)
        {
            debug!(topic = %message.topic, source = ctx.source(), reason, "rejecting publish");
            return PublishOutcome::Failed;
        }

        if let Some(ref metrics) = self.metrics {
            metrics.publish_received(message.payload.len());
        }

        let matches = self.index.find_matches(&message.topic);

        let retained_update = (message.retain && self.config.retain_available)
            .then(|| self.spawn_retained_update(&message, ctx));

        if matches.is_empty() {
            trace!(topic = %message.topic, source = ctx.source(), "no matching subscribers");
            return PublishOutcome::NoMatchingSubscribers;
        }

        let recipients = resolve_recipients(&message, &matches.subscribers);
        let groups = matches.shared_groups;
        let message = Arc::new(message);

        let non_shared = ctx.handle().spawn({
            let router = self.router.clone();
            let message = message.clone();
            let ctx = ctx.clone();
            async move {
                router
                    .distribute_to_non_shared(&recipients, &message, &ctx)
                    .await
            }
        });
        let shared = ctx.handle().spawn({
            let router = self.router.clone();
            let message = message.clone();
            let ctx = ctx.clone();
            async move { router.distribute_to_shared(&groups, &message, &ctx).await }
        });

        let (non_shared, shared) = tokio::join!(non_shared, shared);
        let mut report = DistributionReport::default();
        for (branch, result) in [("non_shared", non_shared), ("shared", shared)] {
            match result {
                Ok(partial) => report.merge(partial),
                Err(e) => warn!(topic = %message.topic, branch, error = %e, "distribution task failed"),
            }
        }

        if let Some(task) = retained_update {
            if let Err(e) = task.await {
                warn!(topic = %message.topic, error = %e, "retained update task failed");
            }
        }

        debug!(
            topic = %message.topic,
            source = ctx.source(),
            delivered = report.delivered,
            queued = report.queued,
            dropped = report.dropped,
            in_flight = report.in_flight,
            skipped_groups = report.skipped_groups,
            "publish dispatched"
        );
        PublishOutcome::Delivered
    }

    /// Store or clear the retained message of the publish topic in the background
    fn spawn_retained_update(&self, message: &PublishMessage, ctx: &DispatchContext) -> JoinHandle<()> {
        let store = self.retained.clone();
        let metrics = self.metrics.clone();
        let topic = message.topic.clone();
        let payload = message.payload.clone();
        let qos = message.qos;
        let clears = message.clears_retained();

        ctx.handle().spawn(async move {
            let (op, result) = if clears {
                ("remove", store.remove(&topic).await)
            } else {
                ("store", store.store(&topic, payload, qos).await)
            };

            match result {
                Ok(()) => {
                    trace!(topic = %topic, op, "retained store updated");
                    if let Some(ref metrics) = metrics {
                        metrics.retained_updated(op);
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, op, error = %e, "retained store update failed");
                    if let Some(ref metrics) = metrics {
                        metrics.retained_errors_total.inc();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use crate::topic::SubscriptionFlags;
    use smallvec::smallvec;

    fn matched(client: &str, qos: QoS, flags: SubscriptionFlags) -> MatchedSubscriber {
        MatchedSubscriber {
            client_id: Arc::from(client),
            qos,
            flags,
            subscription_ids: smallvec![],
        }
    }

    #[test]
    fn test_no_local_drops_only_the_publisher() {
        let message = PublishMessage::new("t", "x", QoS::AtLeastOnce).with_sender("X");
        let subs = [
            matched("X", QoS::AtLeastOnce, SubscriptionFlags::NO_LOCAL),
            matched("Y", QoS::AtLeastOnce, SubscriptionFlags::NO_LOCAL),
        ];

        let recipients = resolve_recipients(&message, &subs);
        assert_eq!(recipients.len(), 1);
        assert_eq!(&*recipients[0].client_id, "Y");

        let subs = [matched("X", QoS::AtLeastOnce, SubscriptionFlags::empty())];
        assert_eq!(resolve_recipients(&message, &subs).len(), 1);
    }

    #[test]
    fn test_granted_qos_and_retain() {
        let message = PublishMessage::new("t", "x", QoS::AtLeastOnce).with_retain(true);
        let subs = [
            matched("a", QoS::ExactlyOnce, SubscriptionFlags::RETAIN_AS_PUBLISHED),
            matched("b", QoS::AtMostOnce, SubscriptionFlags::empty()),
        ];

        let recipients = resolve_recipients(&message, &subs);
        assert_eq!(recipients[0].qos, QoS::AtLeastOnce);
        assert!(recipients[0].retain);
        assert_eq!(recipients[1].qos, QoS::AtMostOnce);
        assert!(!recipients[1].retain);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(PublishOutcome::Delivered.to_string(), "delivered");
        assert_eq!(
            PublishOutcome::NoMatchingSubscribers.as_str(),
            "no_matching_subscribers"
        );
        assert_eq!(PublishOutcome::Failed.as_str(), "failed");
    }
}
