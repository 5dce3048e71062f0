//! Message Router
//!
//! Fans a resolved match out to recipients. Every recipient gets its own
//! delivery future; a failing or panicking collaborator only affects its
//! own copy, which is reported to the dropped-message sink.
//!
//! A hand-off that does not complete on its first poll is moved to its own
//! task on the dispatch runtime, so a stalled channel never holds up the
//! publish that reached it.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use rand::Rng;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::DispatchContext;
use crate::config::SharedStrategy;
use crate::hooks::{DropReason, DroppedMessageSink};
use crate::metrics::Metrics;
use crate::protocol::{PublishMessage, QoS};
use crate::session::{DeliveryChannel, DeliveryError, QueueResult, SessionRegistry};
use crate::topic::{SharedGroup, SubscriberEntry, SubscriptionFlags, SubscriptionIndex};

/// A resolved non-shared recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub client_id: Arc<str>,
    /// QoS after capping by the publish QoS
    pub qos: QoS,
    /// Retain flag the recipient copy carries
    pub retain: bool,
    pub subscription_ids: SmallVec<[u32; 4]>,
}

/// Tally of one distribution call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Handed to a live channel
    pub delivered: usize,
    /// Parked in an offline queue
    pub queued: usize,
    /// Reported to the dropped-message sink
    pub dropped: usize,
    /// Started but not yet settled; finished in the background
    pub in_flight: usize,
    /// Shared groups with no connected member
    pub skipped_groups: usize,
}

impl DistributionReport {
    pub fn merge(&mut self, other: DistributionReport) {
        self.delivered += other.delivered;
        self.queued += other.queued;
        self.dropped += other.dropped;
        self.in_flight += other.in_flight;
        self.skipped_groups += other.skipped_groups;
    }

    fn count(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered => self.delivered += 1,
            DeliveryStatus::Queued => self.queued += 1,
            DeliveryStatus::Dropped => self.dropped += 1,
            DeliveryStatus::InFlight => self.in_flight += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryStatus {
    Delivered,
    Queued,
    Dropped,
    InFlight,
}

/// Message router for distributing messages to subscribers
pub struct MessageRouter {
    index: Arc<SubscriptionIndex>,
    sessions: Arc<dyn SessionRegistry>,
    dropped: Arc<dyn DroppedMessageSink>,
    strategy: SharedStrategy,
    delivery_timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

impl MessageRouter {
    pub fn new(
        index: Arc<SubscriptionIndex>,
        sessions: Arc<dyn SessionRegistry>,
        dropped: Arc<dyn DroppedMessageSink>,
    ) -> Self {
        Self {
            index,
            sessions,
            dropped,
            strategy: SharedStrategy::default(),
            delivery_timeout: None,
            metrics: None,
        }
    }

    pub fn with_strategy(mut self, strategy: SharedStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Deliver one copy per recipient.
    ///
    /// Completes once every hand-off has been attempted. Copies always go
    /// out with the duplicate flag cleared.
    pub async fn distribute_to_non_shared(
        &self,
        recipients: &[Recipient],
        message: &PublishMessage,
        ctx: &DispatchContext,
    ) -> DistributionReport {
        let deliveries = recipients.iter().map(|r| {
            let copy = message.recipient_copy(r.qos, r.retain, &r.subscription_ids);
            self.isolated(r.client_id.clone(), copy, ctx)
        });

        let mut report = DistributionReport::default();
        for status in join_all(deliveries).await {
            report.count(status);
        }

        trace!(
            source = ctx.source(),
            topic = %message.topic,
            delivered = report.delivered,
            queued = report.queued,
            dropped = report.dropped,
            in_flight = report.in_flight,
            "non-shared distribution complete"
        );
        report
    }

    /// Deliver to exactly one connected member of each shared group.
    ///
    /// Groups without a connected member are skipped without error.
    pub async fn distribute_to_shared(
        &self,
        group_keys: &[Arc<str>],
        message: &PublishMessage,
        ctx: &DispatchContext,
    ) -> DistributionReport {
        let mut report = DistributionReport::default();
        let mut deliveries = Vec::with_capacity(group_keys.len());

        for key in group_keys {
            let selected = self
                .index
                .shared_group(key)
                .and_then(|group| self.select_member(&group));

            let Some((member, channel)) = selected else {
                debug!(group = %key, topic = %message.topic, "no connected shared member");
                report.skipped_groups += 1;
                if let Some(ref metrics) = self.metrics {
                    metrics.shared_groups_skipped_total.inc();
                }
                continue;
            };

            let retain =
                message.retain && member.flags.contains(SubscriptionFlags::RETAIN_AS_PUBLISHED);
            let copy = message.recipient_copy(
                message.qos.min(member.qos),
                retain,
                member.subscription_id.as_slice(),
            );
            trace!(group = %key, client_id = %member.client_id, "selected shared member");
            deliveries.push(self.hand_off(member.client_id, channel, copy, ctx));
        }

        for status in join_all(deliveries).await {
            report.count(status);
        }

        trace!(
            source = ctx.source(),
            topic = %message.topic,
            groups = group_keys.len(),
            skipped = report.skipped_groups,
            "shared distribution complete"
        );
        report
    }

    /// Pick one member with a live channel according to the configured strategy
    fn select_member(
        &self,
        group: &SharedGroup,
    ) -> Option<(SubscriberEntry, Arc<dyn DeliveryChannel>)> {
        let mut live: SmallVec<[(SubscriberEntry, Arc<dyn DeliveryChannel>); 4]> = group
            .members()
            .into_iter()
            .filter_map(|member| {
                let channel = self.live_channel(&member.client_id)?;
                Some((member, channel))
            })
            .collect();

        if live.is_empty() {
            return None;
        }

        let idx = match self.strategy {
            SharedStrategy::RoundRobin => group.advance() % live.len(),
            SharedStrategy::Random => rand::thread_rng().gen_range(0..live.len()),
        };
        Some(live.swap_remove(idx))
    }

    /// Live channel of a client, or `None` when it is offline.
    ///
    /// A registry or channel that panics while being asked counts as offline
    /// for shared selection; non-shared delivery catches it one level up.
    fn live_channel(&self, client_id: &str) -> Option<Arc<dyn DeliveryChannel>> {
        let lookup = catch_unwind(AssertUnwindSafe(|| {
            self.sessions
                .channel(client_id)
                .filter(|channel| channel.is_live())
        }));
        lookup.unwrap_or_else(|_| {
            warn!(client_id, "session lookup panicked, skipping member");
            None
        })
    }

    /// Deliver one copy with every collaborator call confined to this recipient
    async fn isolated(
        &self,
        client_id: Arc<str>,
        copy: PublishMessage,
        ctx: &DispatchContext,
    ) -> DeliveryStatus {
        let attempt = self.deliver(client_id.clone(), copy.clone(), ctx);
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(status) => status,
            Err(_) => {
                warn!(client_id = %client_id, "collaborator panicked during delivery");
                self.record_drop(DropReason::Other, &copy, &client_id);
                DeliveryStatus::Dropped
            }
        }
    }

    /// Deliver to a live channel, or park the copy when the client is offline
    async fn deliver(
        &self,
        client_id: Arc<str>,
        copy: PublishMessage,
        ctx: &DispatchContext,
    ) -> DeliveryStatus {
        let channel = self
            .sessions
            .channel(&client_id)
            .filter(|channel| channel.is_live());
        match channel {
            Some(channel) => self.hand_off(client_id, channel, copy, ctx).await,
            None => self.park(client_id, copy).await,
        }
    }

    /// Start a hand-off and settle it inline if the channel accepts at once.
    ///
    /// Otherwise the attempt keeps running on the dispatch runtime, bounded
    /// by the delivery timeout when one is set.
    async fn hand_off(
        &self,
        client_id: Arc<str>,
        channel: Arc<dyn DeliveryChannel>,
        copy: PublishMessage,
        ctx: &DispatchContext,
    ) -> DeliveryStatus {
        let limit = self.delivery_timeout;
        let dropped = self.dropped.clone();
        let metrics = self.metrics.clone();
        let peer = client_id.clone();

        let mut attempt = Box::pin(async move {
            let sent = guarded(async { channel.deliver(copy.clone()).await });
            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, sent)
                    .await
                    .unwrap_or(Err(DeliveryError::Timeout)),
                None => sent.await,
            };

            match result {
                Ok(()) => {
                    if let Some(ref metrics) = metrics {
                        metrics.messages_delivered_total.inc();
                    }
                    DeliveryStatus::Delivered
                }
                Err(e) => {
                    debug!(client_id = %peer, error = %e, "delivery failed");
                    dropped.record(DropReason::from(&e), &copy, Some(&peer));
                    DeliveryStatus::Dropped
                }
            }
        });

        match futures_util::poll!(attempt.as_mut()) {
            Poll::Ready(status) => status,
            Poll::Pending => {
                trace!(client_id = %client_id, "hand-off pending, finishing in background");
                ctx.handle().spawn(attempt);
                DeliveryStatus::InFlight
            }
        }
    }

    async fn park(&self, client_id: Arc<str>, copy: PublishMessage) -> DeliveryStatus {
        match guarded(self.sessions.enqueue_offline(&client_id, copy.clone())).await {
            Ok(QueueResult::Queued) => {
                self.count_queued();
                DeliveryStatus::Queued
            }
            Ok(QueueResult::DroppedOldest(evicted)) => {
                self.record_drop(DropReason::QueueFull, &evicted, &client_id);
                self.count_queued();
                DeliveryStatus::Queued
            }
            Ok(QueueResult::NoSession) => {
                self.record_drop(DropReason::NoSession, &copy, &client_id);
                DeliveryStatus::Dropped
            }
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "offline queueing failed");
                self.record_drop(DropReason::from(&e), &copy, &client_id);
                DeliveryStatus::Dropped
            }
        }
    }

    fn count_queued(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.messages_queued_total.inc();
        }
    }

    fn record_drop(&self, reason: DropReason, message: &PublishMessage, client_id: &str) {
        self.dropped.record(reason, message, Some(client_id));
    }
}

/// Turn a panic inside a collaborator into an ordinary delivery error
async fn guarded<T, F>(attempt: F) -> Result<T, DeliveryError>
where
    F: Future<Output = Result<T, DeliveryError>>,
{
    AssertUnwindSafe(attempt)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(DeliveryError::Other("collaborator panicked".to_string())))
}
