//! Router tests with in-memory channels

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use smallvec::smallvec;

use super::*;
use crate::hooks::{DropReason, DroppedMessageSink};
use crate::persistence::MemoryRetainedStore;
use crate::protocol::{PublishMessage, QoS};
use crate::session::{
    DeliveryChannel, DeliveryError, LocalSessionRegistry, QueueResult, SessionRegistry,
};
use crate::topic::{SubscriberEntry, SubscriptionIndex};

enum Behavior {
    Accept,
    Fail(DeliveryError),
    Panic,
    PanicOnLiveCheck,
    Stall,
}

struct FakeChannel {
    behavior: Behavior,
    live: AtomicBool,
    received: Mutex<Vec<PublishMessage>>,
}

impl FakeChannel {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            live: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl DeliveryChannel for FakeChannel {
    async fn deliver(&self, message: PublishMessage) -> Result<(), DeliveryError> {
        match &self.behavior {
            Behavior::Accept | Behavior::PanicOnLiveCheck => {
                self.received.lock().push(message);
                Ok(())
            }
            Behavior::Fail(e) => Err(e.clone()),
            Behavior::Panic => panic!("channel blew up"),
            Behavior::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn is_live(&self) -> bool {
        if matches!(self.behavior, Behavior::PanicOnLiveCheck) {
            panic!("liveness check blew up");
        }
        self.live.load(Ordering::SeqCst)
    }
}

/// Registry whose lookup panics for one client
struct CursedRegistry {
    inner: LocalSessionRegistry,
    cursed: &'static str,
}

#[async_trait]
impl SessionRegistry for CursedRegistry {
    fn channel(&self, client_id: &str) -> Option<Arc<dyn DeliveryChannel>> {
        if client_id == self.cursed {
            panic!("registry lookup blew up");
        }
        self.inner.channel(client_id)
    }

    async fn enqueue_offline(
        &self,
        client_id: &str,
        message: PublishMessage,
    ) -> Result<QueueResult, DeliveryError> {
        self.inner.enqueue_offline(client_id, message).await
    }
}

/// Poll until `check` holds, giving background hand-offs time to settle
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct RecordingSink {
    drops: Mutex<Vec<(DropReason, String)>>,
}

impl DroppedMessageSink for RecordingSink {
    fn record(&self, reason: DropReason, _message: &PublishMessage, client_id: Option<&str>) {
        self.drops
            .lock()
            .push((reason, client_id.unwrap_or_default().to_string()));
    }
}

struct Harness {
    index: Arc<SubscriptionIndex>,
    sessions: Arc<LocalSessionRegistry>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            index: Arc::new(SubscriptionIndex::new()),
            sessions: Arc::new(LocalSessionRegistry::new(2)),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn router(&self) -> MessageRouter {
        MessageRouter::new(self.index.clone(), self.sessions.clone(), self.sink.clone())
    }

    fn connect(&self, client: &str, behavior: Behavior) -> Arc<FakeChannel> {
        let channel = FakeChannel::new(behavior);
        self.sessions.register(client, channel.clone(), false);
        channel
    }

    fn share(&self, client: &str, qos: QoS) {
        self.index
            .add_subscription("$share/g/t", SubscriberEntry::new(client, qos))
            .unwrap();
    }

    fn drops(&self) -> Vec<(DropReason, String)> {
        self.sink.drops.lock().clone()
    }
}

fn recipient(client: &str, qos: QoS) -> Recipient {
    Recipient {
        client_id: Arc::from(client),
        qos,
        retain: false,
        subscription_ids: smallvec![],
    }
}

fn group_key() -> Vec<Arc<str>> {
    vec![Arc::from("g/t")]
}

#[tokio::test]
async fn test_non_shared_isolates_failing_recipients() {
    let h = Harness::new();
    h.connect("closed", Behavior::Fail(DeliveryError::ChannelClosed));
    let ok = h.connect("ok", Behavior::Accept);
    h.connect("panics", Behavior::Panic);

    let recipients = [
        recipient("closed", QoS::AtLeastOnce),
        recipient("ok", QoS::AtLeastOnce),
        recipient("panics", QoS::AtLeastOnce),
    ];
    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);
    let report = h
        .router()
        .distribute_to_non_shared(&recipients, &message, &DispatchContext::current())
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 2);
    assert_eq!(ok.count(), 1);

    let mut drops = h.drops();
    drops.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        drops,
        vec![
            (DropReason::ChannelClosed, "closed".to_string()),
            (DropReason::Other, "panics".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_copies_carry_granted_qos_and_clear_dup() {
    let h = Harness::new();
    let low = h.connect("low", Behavior::Accept);

    let mut r = recipient("low", QoS::AtMostOnce);
    r.retain = true;
    r.subscription_ids = smallvec![4, 9];
    let message = PublishMessage::new("t", "x", QoS::ExactlyOnce)
        .with_dup(true)
        .with_retain(true);

    h.router()
        .distribute_to_non_shared(&[r], &message, &DispatchContext::current())
        .await;

    let got = low.received.lock()[0].clone();
    assert_eq!(got.qos, QoS::AtMostOnce);
    assert!(!got.dup);
    assert!(got.retain);
    assert_eq!(got.subscription_ids.to_vec(), vec![4, 9]);
}

#[tokio::test]
async fn test_offline_recipients_are_queued() {
    let h = Harness::new();
    let channel = FakeChannel::new(Behavior::Accept);
    h.sessions.register("persistent", channel, true);
    h.sessions.unregister("persistent");

    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);
    let recipients = [
        recipient("persistent", QoS::AtLeastOnce),
        recipient("gone", QoS::AtLeastOnce),
    ];
    let ctx = DispatchContext::current();
    let router = h.router();

    let report = router
        .distribute_to_non_shared(&recipients, &message, &ctx)
        .await;
    assert_eq!(report.queued, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(h.drops(), vec![(DropReason::NoSession, "gone".to_string())]);

    // queue limit is 2, third message evicts the first
    router
        .distribute_to_non_shared(&recipients[..1], &message, &ctx)
        .await;
    let report = router
        .distribute_to_non_shared(&recipients[..1], &message, &ctx)
        .await;
    assert_eq!(report.queued, 1);
    assert_eq!(h.sessions.offline_len("persistent"), 2);
    assert_eq!(
        h.drops().last().cloned(),
        Some((DropReason::QueueFull, "persistent".to_string()))
    );
}

#[tokio::test]
async fn test_stalled_channel_times_out() {
    let h = Harness::new();
    h.connect("slow", Behavior::Stall);
    let fast = h.connect("fast", Behavior::Accept);

    let router = h
        .router()
        .with_delivery_timeout(Some(Duration::from_millis(20)));
    let message = PublishMessage::new("t", "x", QoS::AtMostOnce);
    let report = router
        .distribute_to_non_shared(
            &[recipient("slow", QoS::AtMostOnce), recipient("fast", QoS::AtMostOnce)],
            &message,
            &DispatchContext::current(),
        )
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.in_flight, 1);
    assert_eq!(fast.count(), 1);
    assert!(h.drops().is_empty());

    eventually(|| !h.drops().is_empty()).await;
    assert_eq!(h.drops(), vec![(DropReason::Timeout, "slow".to_string())]);
}

#[tokio::test]
async fn test_stalled_channel_without_timeout_does_not_block() {
    let h = Harness::new();
    h.connect("stuck", Behavior::Stall);
    let fast = h.connect("fast", Behavior::Accept);

    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);
    let recipients = [
        recipient("stuck", QoS::AtLeastOnce),
        recipient("fast", QoS::AtLeastOnce),
    ];
    let report = tokio::time::timeout(
        Duration::from_secs(1),
        h.router()
            .distribute_to_non_shared(&recipients, &message, &DispatchContext::current()),
    )
    .await
    .expect("distribution blocked on a stalled channel");

    assert_eq!(report.delivered, 1);
    assert_eq!(report.in_flight, 1);
    assert_eq!(fast.count(), 1);
    assert!(h.drops().is_empty());
}

#[tokio::test]
async fn test_panicking_lookup_only_drops_its_recipient() {
    let registry = Arc::new(CursedRegistry {
        inner: LocalSessionRegistry::new(2),
        cursed: "cursed",
    });
    let ok = FakeChannel::new(Behavior::Accept);
    registry.inner.register("ok", ok.clone(), false);
    let sink = Arc::new(RecordingSink::default());
    let router = MessageRouter::new(
        Arc::new(SubscriptionIndex::new()),
        registry,
        sink.clone(),
    );

    let message = PublishMessage::new("t", "x", QoS::AtMostOnce);
    let report = router
        .distribute_to_non_shared(
            &[recipient("cursed", QoS::AtMostOnce), recipient("ok", QoS::AtMostOnce)],
            &message,
            &DispatchContext::current(),
        )
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(ok.count(), 1);
    assert_eq!(
        *sink.drops.lock(),
        vec![(DropReason::Other, "cursed".to_string())]
    );
}

#[tokio::test]
async fn test_panicking_liveness_check_does_not_cost_other_subscribers() {
    let sessions = Arc::new(LocalSessionRegistry::new(2));
    let sink = Arc::new(RecordingSink::default());
    let broker = Broker::new(
        BrokerConfig::default(),
        sessions.clone(),
        Arc::new(MemoryRetainedStore::new()),
        sink.clone(),
    );

    let bad = FakeChannel::new(Behavior::PanicOnLiveCheck);
    let good = FakeChannel::new(Behavior::Accept);
    sessions.register("sub1", bad.clone(), false);
    sessions.register("sub2", good.clone(), false);
    for client in ["sub1", "sub2"] {
        broker
            .subscribe("t", SubscriberEntry::new(client, QoS::AtMostOnce))
            .unwrap();
    }

    let outcome = broker
        .publish(
            PublishMessage::new("t", "x", QoS::AtMostOnce),
            &DispatchContext::current(),
        )
        .await;

    assert_eq!(outcome, PublishOutcome::Delivered);
    assert_eq!(good.count(), 1);
    assert_eq!(bad.count(), 0);
    assert_eq!(
        *sink.drops.lock(),
        vec![(DropReason::Other, "sub1".to_string())]
    );
}

#[tokio::test]
async fn test_shared_selection_skips_member_with_panicking_liveness_check() {
    let h = Harness::new();
    let bad = h.connect("A", Behavior::PanicOnLiveCheck);
    let good = h.connect("B", Behavior::Accept);
    h.share("A", QoS::AtMostOnce);
    h.share("B", QoS::AtMostOnce);

    let router = h.router();
    let ctx = DispatchContext::current();
    let message = PublishMessage::new("t", "x", QoS::AtMostOnce);
    for _ in 0..3 {
        let report = router.distribute_to_shared(&group_key(), &message, &ctx).await;
        assert_eq!(report.delivered, 1);
    }

    assert_eq!(bad.count(), 0);
    assert_eq!(good.count(), 3);
}

#[tokio::test]
async fn test_round_robin_rotates_members() {
    let h = Harness::new();
    let a = h.connect("A", Behavior::Accept);
    let b = h.connect("B", Behavior::Accept);
    h.share("A", QoS::AtLeastOnce);
    h.share("B", QoS::AtLeastOnce);

    let router = h.router();
    let ctx = DispatchContext::current();
    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);

    let mut order = Vec::new();
    for _ in 0..4 {
        let before = (a.count(), b.count());
        let report = router.distribute_to_shared(&group_key(), &message, &ctx).await;
        assert_eq!(report.delivered, 1);
        order.push(if a.count() > before.0 { "A" } else { "B" });
    }
    assert_eq!(order, vec!["A", "B", "A", "B"]);
}

#[tokio::test]
async fn test_round_robin_skips_disconnected_members() {
    let h = Harness::new();
    let a = h.connect("A", Behavior::Accept);
    let c = h.connect("C", Behavior::Accept);
    let b = h.connect("B", Behavior::Accept);
    b.live.store(false, Ordering::SeqCst);
    for client in ["A", "B", "C"] {
        h.share(client, QoS::AtMostOnce);
    }

    let router = h.router();
    let ctx = DispatchContext::current();
    let message = PublishMessage::new("t", "x", QoS::AtMostOnce);
    for _ in 0..6 {
        router.distribute_to_shared(&group_key(), &message, &ctx).await;
    }

    assert_eq!(b.count(), 0);
    assert_eq!(a.count(), 3);
    assert_eq!(c.count(), 3);
}

#[tokio::test]
async fn test_group_without_live_members_is_skipped() {
    let h = Harness::new();
    h.share("A", QoS::AtLeastOnce);

    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);
    let mut keys = group_key();
    keys.push(Arc::from("missing/t"));
    let report = h
        .router()
        .distribute_to_shared(&keys, &message, &DispatchContext::current())
        .await;

    assert_eq!(report.skipped_groups, 2);
    assert_eq!(report.delivered + report.dropped + report.queued, 0);
    assert!(h.drops().is_empty());
}

#[tokio::test]
async fn test_random_strategy_picks_live_members_only() {
    let h = Harness::new();
    let a = h.connect("A", Behavior::Accept);
    let b = h.connect("B", Behavior::Accept);
    h.share("A", QoS::AtLeastOnce);
    h.share("B", QoS::AtLeastOnce);
    h.share("offline", QoS::AtLeastOnce);

    let router = h.router().with_strategy(SharedStrategy::Random);
    let ctx = DispatchContext::current();
    let message = PublishMessage::new("t", "x", QoS::AtLeastOnce);
    for _ in 0..50 {
        let report = router.distribute_to_shared(&group_key(), &message, &ctx).await;
        assert_eq!(report.delivered, 1);
    }
    assert_eq!(a.count() + b.count(), 50);
}

#[tokio::test]
async fn test_shared_copy_uses_member_options() {
    let h = Harness::new();
    let a = h.connect("A", Behavior::Accept);
    h.index
        .add_subscription(
            "$share/g/t",
            SubscriberEntry::new("A", QoS::AtMostOnce)
                .retain_as_published(true)
                .with_subscription_id(11),
        )
        .unwrap();

    let message = PublishMessage::new("t", "x", QoS::ExactlyOnce)
        .with_dup(true)
        .with_retain(true);
    h.router()
        .distribute_to_shared(&group_key(), &message, &DispatchContext::current())
        .await;

    let got = a.received.lock()[0].clone();
    assert_eq!(got.qos, QoS::AtMostOnce);
    assert!(!got.dup);
    assert!(got.retain);
    assert_eq!(got.subscription_ids.to_vec(), vec![11]);
}

#[test]
fn test_broker_config_from_config() {
    let config = crate::config::Config::parse(
        r#"
[limits]
max_topic_levels = 4

[dispatch]
shared_strategy = "random"
delivery_timeout = "1s"

[retain]
enabled = false
"#,
    )
    .unwrap();

    let broker_config = BrokerConfig::from(&config);
    assert_eq!(broker_config.max_topic_levels, 4);
    assert_eq!(broker_config.shared_strategy, SharedStrategy::Random);
    assert_eq!(broker_config.delivery_timeout, Some(Duration::from_secs(1)));
    assert!(!broker_config.retain_available);
}

#[tokio::test]
async fn test_dispatch_context_source() {
    let ctx = DispatchContext::current().with_source("bridge:upstream");
    assert_eq!(ctx.source(), "bridge:upstream");
    assert_eq!(DispatchContext::current().source(), "local");
}
