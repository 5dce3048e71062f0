//! Retained message storage.
//!
//! The publish path only talks to [`RetainedStore`]; durable backends live
//! outside this crate and implement the same trait. [`MemoryRetainedStore`]
//! keeps everything in a `DashMap` and is what the binary runs with.

mod error;

pub use error::{PersistenceError, Result};

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// Retained message held for future subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: SystemTime,
}

/// Per-topic retained message storage
#[async_trait]
pub trait RetainedStore: Send + Sync {
    /// Store or replace the retained message of a topic
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<()>;

    /// Clear the retained message of a topic (no-op if absent)
    async fn remove(&self, topic: &str) -> Result<()>;

    /// Retained message of an exact topic
    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>>;

    /// Retained messages whose topic matches a subscription filter
    async fn matching(&self, filter: &str) -> Result<Vec<RetainedMessage>>;
}

#[async_trait]
impl<T: RetainedStore + ?Sized> RetainedStore for Arc<T> {
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<()> {
        (**self).store(topic, payload, qos).await
    }

    async fn remove(&self, topic: &str) -> Result<()> {
        (**self).remove(topic).await
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>> {
        (**self).get(topic).await
    }

    async fn matching(&self, filter: &str) -> Result<Vec<RetainedMessage>> {
        (**self).matching(filter).await
    }
}

/// In-memory retained store
#[derive(Default)]
pub struct MemoryRetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl MemoryRetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl RetainedStore for MemoryRetainedStore {
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<()> {
        let topic: Arc<str> = Arc::from(topic);
        self.messages.insert(
            topic.clone(),
            RetainedMessage {
                topic,
                payload,
                qos,
                stored_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, topic: &str) -> Result<()> {
        self.messages.remove(topic);
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>> {
        Ok(self.messages.get(topic).map(|m| m.value().clone()))
    }

    async fn matching(&self, filter: &str) -> Result<Vec<RetainedMessage>> {
        let mut found: Vec<RetainedMessage> = self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(found)
    }
}
