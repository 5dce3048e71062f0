//! Broker Core
//!
//! Ties the subscription index, the message router and the injected
//! collaborators (sessions, retained store, dropped-message sink) together.
//! Protocol handlers call [`Broker::publish`] for every inbound publish and
//! the subscribe/unsubscribe entry points for session management.

mod publish;
mod router;

#[cfg(test)]
mod tests;

pub use publish::PublishOutcome;
pub use router::{DistributionReport, MessageRouter, Recipient};

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use crate::config::{Config, SharedStrategy};
use crate::hooks::DroppedMessageSink;
use crate::metrics::Metrics;
use crate::persistence::{PersistenceError, RetainedMessage, RetainedStore};
use crate::session::SessionRegistry;
use crate::topic::{IndexError, SubscriberEntry, SubscriptionIndex};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum topic levels for names and filters (0 = unlimited)
    pub max_topic_levels: usize,
    /// Whether retained publishes update the retained store
    pub retain_available: bool,
    /// Shared subscription member selection
    pub shared_strategy: SharedStrategy,
    /// Deadline for a single hand-off to a delivery channel
    pub delivery_timeout: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_topic_levels: 0,
            retain_available: true,
            shared_strategy: SharedStrategy::RoundRobin,
            delivery_timeout: None,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_topic_levels: config.limits.max_topic_levels,
            retain_available: config.retain.enabled,
            shared_strategy: config.dispatch.shared_strategy,
            delivery_timeout: config.dispatch.delivery_timeout,
        }
    }
}

/// Where a publish is dispatched from.
///
/// Carries the runtime handle the fan-out and retained tasks are spawned
/// on, plus a label identifying the calling layer in logs.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    handle: Handle,
    source: Arc<str>,
}

impl DispatchContext {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            source: Arc::from("local"),
        }
    }

    /// Context bound to the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn with_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.source = source.into();
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// The publish matching and fan-out core
pub struct Broker {
    config: BrokerConfig,
    index: Arc<SubscriptionIndex>,
    router: Arc<MessageRouter>,
    sessions: Arc<dyn SessionRegistry>,
    retained: Arc<dyn RetainedStore>,
    dropped: Arc<dyn DroppedMessageSink>,
    metrics: Option<Arc<Metrics>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        sessions: Arc<dyn SessionRegistry>,
        retained: Arc<dyn RetainedStore>,
        dropped: Arc<dyn DroppedMessageSink>,
    ) -> Self {
        let index = Arc::new(SubscriptionIndex::with_max_topic_levels(
            config.max_topic_levels,
        ));
        let router = Self::build_router(&config, &index, &sessions, &dropped, None);

        Self {
            config,
            index,
            router,
            sessions,
            retained,
            dropped,
            metrics: None,
        }
    }

    /// Attach Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.router = Self::build_router(
            &self.config,
            &self.index,
            &self.sessions,
            &self.dropped,
            Some(metrics.clone()),
        );
        self.metrics = Some(metrics);
        self
    }

    fn build_router(
        config: &BrokerConfig,
        index: &Arc<SubscriptionIndex>,
        sessions: &Arc<dyn SessionRegistry>,
        dropped: &Arc<dyn DroppedMessageSink>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<MessageRouter> {
        let router = MessageRouter::new(index.clone(), sessions.clone(), dropped.clone())
            .with_strategy(config.shared_strategy)
            .with_delivery_timeout(config.delivery_timeout)
            .with_metrics(metrics);
        Arc::new(router)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.index
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Add or replace a subscription. Returns true if it is new.
    pub fn subscribe(&self, filter: &str, entry: SubscriberEntry) -> Result<bool, IndexError> {
        let client_id = entry.client_id.clone();
        let created = self.index.add_subscription(filter, entry)?;
        debug!(client_id = %client_id, filter, created, "subscription added");

        if let Some(ref metrics) = self.metrics {
            if created {
                metrics.subscription_added();
            }
            self.update_group_gauge(metrics);
        }
        Ok(created)
    }

    /// Remove one subscription
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let removed = self.index.remove_subscription(filter, client_id);
        debug!(client_id, filter, removed, "unsubscribe");

        if let Some(ref metrics) = self.metrics {
            if removed {
                metrics.subscriptions_removed(1);
            }
            self.update_group_gauge(metrics);
        }
        removed
    }

    /// Remove every subscription of a client whose session ended
    pub fn remove_client(&self, client_id: &str) -> usize {
        let removed = self.index.remove_client(client_id);
        if removed > 0 {
            debug!(client_id, removed, "client subscriptions removed");
        }

        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_removed(removed);
            self.update_group_gauge(metrics);
        }
        removed
    }

    /// Retained messages a new subscription to `filter` should receive
    pub async fn retained_for(&self, filter: &str) -> Result<Vec<RetainedMessage>, PersistenceError> {
        self.retained.matching(filter).await
    }

    fn update_group_gauge(&self, metrics: &Metrics) {
        metrics
            .shared_groups_current
            .set(self.index.shared_group_count() as i64);
    }
}
