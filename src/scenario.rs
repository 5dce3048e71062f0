//! Scenario replay
//!
//! Drives a [`Broker`] from a TOML script of connect, subscribe and publish
//! steps and collects what every client ends up receiving. Used by the
//! `edgemq --scenario` command and by the integration tests.
//!
//! ```toml
//! [[step]]
//! action = "connect"
//! client = "sensor-reader"
//!
//! [[step]]
//! action = "subscribe"
//! client = "sensor-reader"
//! filter = "sensors/+/temp"
//! qos = 1
//!
//! [[step]]
//! action = "publish"
//! sender = "sensor-1"
//! topic = "sensors/1/temp"
//! payload = "21.5"
//! qos = 1
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{Broker, DispatchContext, PublishOutcome};
use crate::protocol::{PublishMessage, QoS};
use crate::session::{ChannelWriter, LocalSessionRegistry};
use crate::topic::{IndexError, SubscriberEntry};

/// Scenario error types
#[derive(Debug)]
pub enum ScenarioError {
    /// IO error reading the scenario file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A subscribe step was rejected by the index
    Subscription(IndexError),
    /// A step carries an invalid value
    InvalidStep { index: usize, reason: String },
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Io(e) => write!(f, "IO error: {}", e),
            ScenarioError::Parse(e) => write!(f, "Parse error: {}", e),
            ScenarioError::Subscription(e) => write!(f, "Subscription error: {}", e),
            ScenarioError::InvalidStep { index, reason } => {
                write!(f, "Invalid step {}: {}", index + 1, reason)
            }
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::Io(e) => Some(e),
            ScenarioError::Parse(e) => Some(e),
            ScenarioError::Subscription(e) => Some(e),
            ScenarioError::InvalidStep { .. } => None,
        }
    }
}

impl From<std::io::Error> for ScenarioError {
    fn from(e: std::io::Error) -> Self {
        ScenarioError::Io(e)
    }
}

impl From<toml::de::Error> for ScenarioError {
    fn from(e: toml::de::Error) -> Self {
        ScenarioError::Parse(e)
    }
}

impl From<IndexError> for ScenarioError {
    fn from(e: IndexError) -> Self {
        ScenarioError::Subscription(e)
    }
}

/// One scripted action
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Attach a live channel for a client
    Connect {
        client: String,
        /// Keep subscriptions and queue messages while disconnected
        #[serde(default)]
        persistent: bool,
    },
    /// Drop a client's channel
    Disconnect { client: String },
    Subscribe {
        client: String,
        filter: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        no_local: bool,
        #[serde(default)]
        retain_as_published: bool,
        subscription_id: Option<u32>,
    },
    Unsubscribe { client: String, filter: String },
    Publish {
        sender: Option<String>,
        topic: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
        #[serde(default)]
        dup: bool,
    },
}

/// A parsed scenario
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scenario {
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(content)?)
    }
}

/// A message as observed by a scenario client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
    pub subscription_ids: Vec<u32>,
}

impl From<PublishMessage> for Received {
    fn from(message: PublishMessage) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            qos: message.qos,
            retain: message.retain,
            subscription_ids: message.subscription_ids.to_vec(),
        }
    }
}

/// Outcome of replaying a scenario
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    /// Topic and outcome of every publish step, in order
    pub publishes: Vec<(String, PublishOutcome)>,
    /// Messages received per client, in arrival order
    pub received: BTreeMap<String, Vec<Received>>,
    /// Messages still parked for disconnected persistent clients
    pub queued: BTreeMap<String, usize>,
}

impl ScenarioReport {
    pub fn received_by(&self, client: &str) -> &[Received] {
        self.received.get(client).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "publishes:")?;
        for (topic, outcome) in &self.publishes {
            writeln!(f, "  {} -> {}", topic, outcome)?;
        }
        writeln!(f, "received:")?;
        for (client, messages) in &self.received {
            writeln!(f, "  {} ({})", client, messages.len())?;
            for m in messages {
                writeln!(
                    f,
                    "    {} qos={} retain={} payload={:?}",
                    m.topic,
                    m.qos.as_u8(),
                    m.retain,
                    m.payload
                )?;
            }
        }
        for (client, count) in &self.queued {
            writeln!(f, "queued for {}: {}", client, count)?;
        }
        Ok(())
    }
}

struct ClientState {
    inbox: Option<mpsc::Receiver<PublishMessage>>,
    persistent: bool,
}

/// Replays scenarios against a broker backed by a [`LocalSessionRegistry`]
pub struct ScenarioRunner {
    broker: Arc<Broker>,
    sessions: Arc<LocalSessionRegistry>,
    channel_capacity: usize,
    clients: HashMap<String, ClientState>,
    report: ScenarioReport,
}

impl ScenarioRunner {
    pub fn new(
        broker: Arc<Broker>,
        sessions: Arc<LocalSessionRegistry>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            broker,
            sessions,
            channel_capacity,
            clients: HashMap::new(),
            report: ScenarioReport::default(),
        }
    }

    pub async fn run(
        mut self,
        scenario: &Scenario,
        ctx: &DispatchContext,
    ) -> Result<ScenarioReport, ScenarioError> {
        info!(steps = scenario.steps.len(), "replaying scenario");

        for (index, step) in scenario.steps.iter().enumerate() {
            debug!(step = index + 1, ?step, "scenario step");
            self.apply(index, step, ctx).await?;
            self.collect();
        }

        for (client, state) in &self.clients {
            if state.inbox.is_none() {
                let parked = self.sessions.offline_len(client);
                if parked > 0 {
                    self.report.queued.insert(client.clone(), parked);
                }
            }
        }
        Ok(self.report)
    }

    async fn apply(
        &mut self,
        index: usize,
        step: &Step,
        ctx: &DispatchContext,
    ) -> Result<(), ScenarioError> {
        match step {
            Step::Connect { client, persistent } => self.connect(client, *persistent),
            Step::Disconnect { client } => self.disconnect(client),
            Step::Subscribe {
                client,
                filter,
                qos,
                no_local,
                retain_as_published,
                subscription_id,
            } => {
                let mut entry = SubscriberEntry::new(client.as_str(), parse_qos(index, *qos)?)
                    .no_local(*no_local)
                    .retain_as_published(*retain_as_published);
                if let Some(id) = subscription_id {
                    entry = entry.with_subscription_id(*id);
                }
                self.broker.subscribe(filter, entry)?;
            }
            Step::Unsubscribe { client, filter } => {
                self.broker.unsubscribe(filter, client);
            }
            Step::Publish {
                sender,
                topic,
                payload,
                qos,
                retain,
                dup,
            } => {
                let mut message =
                    PublishMessage::new(topic.as_str(), payload.clone(), parse_qos(index, *qos)?)
                        .with_retain(*retain)
                        .with_dup(*dup);
                if let Some(sender) = sender {
                    message = message.with_sender(sender.as_str());
                }
                let outcome = self.broker.publish(message, ctx).await;
                self.report.publishes.push((topic.clone(), outcome));
            }
        }
        Ok(())
    }

    fn connect(&mut self, client: &str, persistent: bool) {
        let (writer, inbox) = ChannelWriter::channel(self.channel_capacity);
        self.sessions
            .register(client, Arc::new(writer), persistent);

        // Hand over whatever was parked while the client was away
        let backlog = self.sessions.drain_offline(client);
        if !backlog.is_empty() {
            self.report
                .received
                .entry(client.to_string())
                .or_default()
                .extend(backlog.into_iter().map(Received::from));
        }

        self.clients.insert(
            client.to_string(),
            ClientState {
                inbox: Some(inbox),
                persistent,
            },
        );
    }

    fn disconnect(&mut self, client: &str) {
        self.sessions.unregister(client);
        let persistent = match self.clients.get_mut(client) {
            Some(state) => {
                state.inbox = None;
                state.persistent
            }
            None => false,
        };
        if !persistent {
            self.broker.remove_client(client);
            self.sessions.end_session(client);
        }
    }

    /// Move everything sitting in client channels into the report
    fn collect(&mut self) {
        for (client, state) in self.clients.iter_mut() {
            let Some(inbox) = state.inbox.as_mut() else {
                continue;
            };
            while let Ok(message) = inbox.try_recv() {
                self.report
                    .received
                    .entry(client.clone())
                    .or_default()
                    .push(Received::from(message));
            }
        }
    }
}

fn parse_qos(index: usize, qos: u8) -> Result<QoS, ScenarioError> {
    QoS::from_u8(qos).ok_or_else(|| ScenarioError::InvalidStep {
        index,
        reason: format!("invalid qos {}", qos),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::hooks::NoopSink;
    use crate::persistence::MemoryRetainedStore;

    fn runner() -> ScenarioRunner {
        let sessions = Arc::new(LocalSessionRegistry::new(10));
        let broker = Broker::new(
            BrokerConfig::default(),
            sessions.clone(),
            Arc::new(MemoryRetainedStore::new()),
            Arc::new(NoopSink),
        );
        ScenarioRunner::new(Arc::new(broker), sessions, 16)
    }

    #[test]
    fn test_parse_steps() {
        let scenario = Scenario::parse(
            r#"
[[step]]
action = "connect"
client = "a"

[[step]]
action = "subscribe"
client = "a"
filter = "t/#"
qos = 2
subscription_id = 3

[[step]]
action = "publish"
topic = "t/x"
payload = "hi"
"#,
        )
        .unwrap();

        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(
            scenario.steps[0],
            Step::Connect {
                client: "a".into(),
                persistent: false
            }
        );
        assert!(matches!(
            scenario.steps[1],
            Step::Subscribe { qos: 2, subscription_id: Some(3), .. }
        ));
        assert!(matches!(
            &scenario.steps[2],
            Step::Publish { sender: None, qos: 0, retain: false, .. }
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = Scenario::parse("[[step]]\naction = \"explode\"\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }

    #[tokio::test]
    async fn test_replay_collects_deliveries() {
        let scenario = Scenario::parse(
            r#"
[[step]]
action = "connect"
client = "a"

[[step]]
action = "subscribe"
client = "a"
filter = "t/+"
qos = 1

[[step]]
action = "publish"
sender = "p"
topic = "t/1"
payload = "one"
qos = 2

[[step]]
action = "publish"
topic = "other"
"#,
        )
        .unwrap();

        let report = runner()
            .run(&scenario, &DispatchContext::current())
            .await
            .unwrap();

        assert_eq!(
            report.publishes,
            vec![
                ("t/1".to_string(), PublishOutcome::Delivered),
                ("other".to_string(), PublishOutcome::NoMatchingSubscribers),
            ]
        );
        let got = report.received_by("a");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, "one");
        assert_eq!(got[0].qos, QoS::AtLeastOnce);
        assert!(report.to_string().contains("t/1 -> delivered"));
    }

    #[tokio::test]
    async fn test_persistent_client_gets_backlog_on_reconnect() {
        let scenario = Scenario::parse(
            r#"
[[step]]
action = "connect"
client = "p"
persistent = true

[[step]]
action = "subscribe"
client = "p"
filter = "q"
qos = 1

[[step]]
action = "disconnect"
client = "p"

[[step]]
action = "publish"
topic = "q"
payload = "while-away"
qos = 1

[[step]]
action = "connect"
client = "p"
persistent = true
"#,
        )
        .unwrap();

        let report = runner()
            .run(&scenario, &DispatchContext::current())
            .await
            .unwrap();
        let got = report.received_by("p");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, "while-away");
        assert!(report.queued.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_qos_reports_step() {
        let scenario = Scenario::parse(
            r#"
[[step]]
action = "subscribe"
client = "a"
filter = "t"
qos = 3
"#,
        )
        .unwrap();

        let err = runner()
            .run(&scenario, &DispatchContext::current())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid step 1: invalid qos 3");
    }
}
