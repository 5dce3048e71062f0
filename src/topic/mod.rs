//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and the subscription index used
//! on every publish to find the subscribers of a topic.
//!
//! Performance notes:
//! - Matching walks a per-node-locked trie, so lookups proceed while other
//!   clients subscribe and unsubscribe
//! - Overlapping subscriptions of one client are folded in a single pass
//! - Match results use SmallVec for the common case of few subscribers

mod trie;
pub mod validation;


pub use trie::{NodeValue, TopicTrie};
pub use validation::{
    parse_shared_subscription, topic_matches_filter, validate_topic_filter,
    validate_topic_filter_with_max_levels, validate_topic_name,
    validate_topic_name_with_max_levels, TopicLevel,
};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// Subscription index errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// Filter rejected by validation (empty level, misplaced wildcard, ...)
    InvalidFilterSyntax(&'static str),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::InvalidFilterSyntax(reason) => {
                write!(f, "invalid topic filter: {}", reason)
            }
        }
    }
}

impl std::error::Error for IndexError {}

bitflags! {
    /// Per-subscription option flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubscriptionFlags: u8 {
        /// Don't deliver messages back to the client that published them
        const NO_LOCAL = 0b0000_0001;
        /// Keep the publish retain flag instead of clearing it
        const RETAIN_AS_PUBLISHED = 0b0000_0010;
        /// Member of a shared subscription group
        const SHARED = 0b0000_0100;
    }
}

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberEntry {
    /// Client ID
    pub client_id: Arc<str>,
    /// Granted subscription QoS
    pub qos: QoS,
    /// Subscription option flags
    pub flags: SubscriptionFlags,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
    /// Shared group key (`{group}/{filter}`), set by the index for shared subscriptions
    pub share_group: Option<Arc<str>>,
}

impl SubscriberEntry {
    pub fn new(client_id: impl Into<Arc<str>>, qos: QoS) -> Self {
        Self {
            client_id: client_id.into(),
            qos,
            flags: SubscriptionFlags::empty(),
            subscription_id: None,
            share_group: None,
        }
    }

    pub fn no_local(mut self, enabled: bool) -> Self {
        self.flags.set(SubscriptionFlags::NO_LOCAL, enabled);
        self
    }

    pub fn retain_as_published(mut self, enabled: bool) -> Self {
        self.flags.set(SubscriptionFlags::RETAIN_AS_PUBLISHED, enabled);
        self
    }

    pub fn with_subscription_id(mut self, id: u32) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(SubscriptionFlags::SHARED)
    }

    /// Whether this entry and `other` describe the same subscription slot
    fn same_slot(&self, other: &SubscriberEntry) -> bool {
        self.client_id == other.client_id && self.share_group == other.share_group
    }
}

/// One non-shared recipient of a publish, after folding every matching
/// subscription of that client together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedSubscriber {
    pub client_id: Arc<str>,
    /// Highest QoS among the matching subscriptions
    pub qos: QoS,
    /// RETAIN_AS_PUBLISHED if any subscription sets it, NO_LOCAL only if all do
    pub flags: SubscriptionFlags,
    /// Identifiers of all matching subscriptions
    pub subscription_ids: SmallVec<[u32; 4]>,
}

impl MatchedSubscriber {
    fn from_entry(entry: &SubscriberEntry) -> Self {
        Self {
            client_id: entry.client_id.clone(),
            qos: entry.qos,
            flags: entry.flags,
            subscription_ids: entry.subscription_id.into_iter().collect(),
        }
    }

    fn merge(&mut self, entry: &SubscriberEntry) {
        if entry.qos > self.qos {
            self.qos = entry.qos;
        }
        if entry.flags.contains(SubscriptionFlags::RETAIN_AS_PUBLISHED) {
            self.flags.insert(SubscriptionFlags::RETAIN_AS_PUBLISHED);
        }
        if !entry.flags.contains(SubscriptionFlags::NO_LOCAL) {
            self.flags.remove(SubscriptionFlags::NO_LOCAL);
        }
        if let Some(id) = entry.subscription_id {
            if !self.subscription_ids.contains(&id) {
                self.subscription_ids.push(id);
            }
        }
    }

    pub fn no_local(&self) -> bool {
        self.flags.contains(SubscriptionFlags::NO_LOCAL)
    }

    pub fn retain_as_published(&self) -> bool {
        self.flags.contains(SubscriptionFlags::RETAIN_AS_PUBLISHED)
    }
}

/// The index's answer to a topic query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    /// Non-shared subscribers, one per client
    pub subscribers: SmallVec<[MatchedSubscriber; 16]>,
    /// Distinct shared group keys that matched; members are resolved at delivery
    pub shared_groups: SmallVec<[Arc<str>; 4]>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.shared_groups.is_empty()
    }

    pub fn subscriber(&self, client_id: &str) -> Option<&MatchedSubscriber> {
        self.subscribers
            .iter()
            .find(|s| s.client_id.as_ref() == client_id)
    }
}

/// Members of one shared subscription group plus its rotation cursor
#[derive(Debug)]
pub struct SharedGroup {
    key: Arc<str>,
    members: RwLock<Vec<SubscriberEntry>>,
    cursor: AtomicUsize,
}

impl SharedGroup {
    fn new(key: Arc<str>) -> Self {
        Self {
            key,
            members: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// Snapshot of the current members, in subscription order
    pub fn members(&self) -> SmallVec<[SubscriberEntry; 4]> {
        self.members.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Advance the rotation cursor, returning its previous position.
    ///
    /// Concurrent publishes may occasionally observe adjacent positions out of
    /// order; rotation still reaches every member.
    pub fn advance(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn upsert_member(&self, entry: SubscriberEntry) {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.client_id == entry.client_id) {
            Some(existing) => *existing = entry,
            None => members.push(entry),
        }
    }

    fn remove_member(&self, client_id: &str) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|m| m.client_id.as_ref() != client_id);
        members.len() != before
    }
}

/// Build the shared group key for a group name and filter
pub fn shared_group_key(group: &str, filter: &str) -> Arc<str> {
    let mut key = String::with_capacity(group.len() + 1 + filter.len());
    key.push_str(group);
    key.push('/');
    key.push_str(filter);
    key.into()
}

/// Thread-safe subscription index
pub struct SubscriptionIndex {
    trie: TopicTrie<Vec<SubscriberEntry>>,
    /// Live members of every shared group, keyed by group key
    shared_groups: DashMap<Arc<str>, Arc<SharedGroup>>,
    /// Maximum filter depth (0 = unlimited)
    max_topic_levels: usize,
    subscription_count: AtomicUsize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::with_max_topic_levels(0)
    }

    pub fn with_max_topic_levels(max_topic_levels: usize) -> Self {
        Self {
            trie: TopicTrie::new(),
            shared_groups: DashMap::new(),
            max_topic_levels,
            subscription_count: AtomicUsize::new(0),
        }
    }

    /// Add a subscription.
    ///
    /// `filter` is the filter as sent by the client; `$share/{group}/{filter}`
    /// registers `entry` as a shared group member. A client subscribing again
    /// to the same filter (and group) replaces its previous entry.
    ///
    /// Returns `true` if this is a new subscription, `false` if it replaced one.
    pub fn add_subscription(
        &self,
        filter: &str,
        mut entry: SubscriberEntry,
    ) -> Result<bool, IndexError> {
        validate_topic_filter_with_max_levels(filter, self.max_topic_levels)
            .map_err(IndexError::InvalidFilterSyntax)?;

        let actual_filter = match parse_shared_subscription(filter) {
            Some((group, actual)) => {
                entry.flags.insert(SubscriptionFlags::SHARED);
                entry.share_group = Some(shared_group_key(group, actual));
                actual
            }
            None => {
                entry.flags.remove(SubscriptionFlags::SHARED);
                entry.share_group = None;
                filter
            }
        };

        let is_new = self.trie.upsert(actual_filter, |subs| {
            let before = subs.len();
            subs.retain(|s| !s.same_slot(&entry));
            let is_new = subs.len() == before;

            // Group membership changes under the same node lock as the entry
            if let Some(ref key) = entry.share_group {
                self.shared_groups
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(SharedGroup::new(key.clone())))
                    .upsert_member(entry.clone());
            }

            subs.push(entry);
            is_new
        });

        if is_new {
            self.subscription_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(is_new)
    }

    /// Remove a subscription. Returns whether anything was removed.
    pub fn remove_subscription(&self, filter: &str, client_id: &str) -> bool {
        let (actual_filter, share_key) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (actual, Some(shared_group_key(group, actual))),
            None => (filter, None),
        };

        let removed = self
            .trie
            .modify(actual_filter, |subs| {
                let before = subs.len();
                subs.retain(|s| !(s.client_id.as_ref() == client_id && s.share_group == share_key));
                let removed = subs.len() != before;

                if removed {
                    if let Some(ref key) = share_key {
                        self.leave_group(key, client_id);
                    }
                }
                removed
            })
            .unwrap_or(false);

        if removed {
            self.subscription_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every subscription owned by a client (session termination).
    /// Returns the number of subscriptions removed.
    pub fn remove_client(&self, client_id: &str) -> usize {
        let mut removed = 0;
        self.trie.retain_all(|subs| {
            subs.retain(|s| {
                if s.client_id.as_ref() != client_id {
                    return true;
                }
                if let Some(ref key) = s.share_group {
                    self.leave_group(key, client_id);
                }
                removed += 1;
                false
            });
        });

        if removed > 0 {
            self.subscription_count.fetch_sub(removed, Ordering::Relaxed);
        }
        removed
    }

    fn leave_group(&self, key: &Arc<str>, client_id: &str) {
        if let Some(group) = self.shared_groups.get(key) {
            group.remove_member(client_id);
        }
        self.shared_groups.remove_if(key, |_, group| group.is_empty());
    }

    /// Find every subscriber of `topic`.
    ///
    /// Non-shared subscriptions are folded per client; shared subscriptions
    /// contribute their group key once, leaving member selection to delivery.
    pub fn find_matches(&self, topic: &str) -> MatchResult {
        let mut result = MatchResult::default();
        let mut seen: AHashMap<Arc<str>, usize> = AHashMap::with_capacity(16);

        self.trie.matches(topic, |subs| {
            for sub in subs {
                if let Some(ref key) = sub.share_group {
                    if !result.shared_groups.contains(key) {
                        result.shared_groups.push(key.clone());
                    }
                    continue;
                }

                match seen.get(&sub.client_id) {
                    Some(&idx) => result.subscribers[idx].merge(sub),
                    None => {
                        seen.insert(sub.client_id.clone(), result.subscribers.len());
                        result
                            .subscribers
                            .push(MatchedSubscriber::from_entry(sub));
                    }
                }
            }
        });

        result
    }

    /// Look up a shared group by key
    pub fn shared_group(&self, key: &str) -> Option<Arc<SharedGroup>> {
        self.shared_groups.get(key).map(|g| g.value().clone())
    }

    /// Total number of subscriptions, shared members included
    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::Relaxed)
    }

    /// Count the number of shared subscriptions
    pub fn shared_subscription_count(&self) -> usize {
        self.shared_groups.iter().map(|g| g.len()).sum()
    }

    /// Number of distinct shared groups
    pub fn shared_group_count(&self) -> usize {
        self.shared_groups.len()
    }

    /// Every subscription of a client as (filter-independent) entries
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<SubscriberEntry> {
        let mut entries = Vec::new();
        self.trie.for_each(|subs| {
            entries.extend(
                subs.iter()
                    .filter(|s| s.client_id.as_ref() == client_id)
                    .cloned(),
            );
        });
        entries
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}
