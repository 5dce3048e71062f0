//! EdgeMQ - publish matching and fan-out core for MQTT brokers and edge gateways
//!
//! Resolves every inbound publish against a concurrent topic trie, fans it
//! out to ordinary and shared subscribers with per-recipient failure
//! isolation, and keeps retained messages up to date. Transport, protocol
//! encoding and session persistence are left to the embedding broker and
//! plug in through the traits in [`session`], [`persistence`] and [`hooks`].

pub mod broker;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod scenario;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, DispatchContext, PublishOutcome};
pub use config::Config;
pub use hooks::{CompositeSink, DropReason, DroppedMessageSink, LoggingSink};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::{MemoryRetainedStore, RetainedStore};
pub use protocol::{PublishMessage, QoS};
pub use session::{ChannelWriter, DeliveryChannel, LocalSessionRegistry, SessionRegistry};
pub use topic::{SubscriberEntry, SubscriptionIndex};
