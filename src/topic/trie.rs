//! Concurrent topic trie
//!
//! A prefix tree keyed by topic level, supporting `+` and `#` filters.
//!
//! Every node carries its own lock, so lookups on the publish path never
//! contend on a tree-wide lock with subscribe/unsubscribe:
//! - readers hold at most one node lock at a time (children are reference
//!   counted and cloned out before descending)
//! - writers only lock the nodes they modify, always parent before child
//! - empty nodes are pruned eagerly; a pruned node is marked `detached` so a
//!   writer that raced with the prune restarts from the root instead of
//!   writing into an orphaned subtree

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::validation::{parse_levels, TopicLevel};

/// Values stored at trie nodes must be able to report emptiness so that
/// unsubscribe can prune nodes nobody subscribes through anymore.
pub trait NodeValue: Default {
    fn is_empty(&self) -> bool;
}

impl<T> NodeValue for Vec<T> {
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }
}

struct NodeState<V> {
    /// Value for filters terminating exactly at this node
    value: Option<V>,
    /// Literal children (CompactString avoids heap allocation for short levels)
    children: AHashMap<CompactString, Arc<TrieNode<V>>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Arc<TrieNode<V>>>,
    /// Value for the `#` child; `#` is always terminal so it needs no node
    multi_wildcard: Option<V>,
    /// Set once the node has been unlinked from its parent
    detached: bool,
}

impl<V> NodeState<V> {
    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }

    // `#` only ever appears as the last filter level and is stored in
    // `multi_wildcard`, so the path helpers below never see it.

    fn child(&self, level: TopicLevel<'_>) -> Option<&Arc<TrieNode<V>>> {
        match level {
            TopicLevel::Literal(s) => self.children.get(s),
            TopicLevel::SingleWildcard => self.single_wildcard.as_ref(),
            TopicLevel::MultiWildcard => None,
        }
    }

    fn child_or_insert(&mut self, level: TopicLevel<'_>) -> Arc<TrieNode<V>> {
        let slot = match level {
            TopicLevel::Literal(s) => self.children.entry(CompactString::new(s)).or_default(),
            TopicLevel::SingleWildcard | TopicLevel::MultiWildcard => {
                self.single_wildcard.get_or_insert_with(Default::default)
            }
        };
        slot.clone()
    }

    fn remove_child(&mut self, level: TopicLevel<'_>) {
        match level {
            TopicLevel::Literal(s) => {
                self.children.remove(s);
            }
            TopicLevel::SingleWildcard | TopicLevel::MultiWildcard => {
                self.single_wildcard = None;
            }
        }
    }

    /// The slot a filter ending at this node stores its value in
    fn slot(&mut self, multi: bool) -> &mut Option<V> {
        if multi {
            &mut self.multi_wildcard
        } else {
            &mut self.value
        }
    }
}

struct TrieNode<V> {
    state: RwLock<NodeState<V>>,
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            state: RwLock::new(NodeState {
                value: None,
                // Most nodes have few children
                children: AHashMap::with_capacity(4),
                single_wildcard: None,
                multi_wildcard: None,
                detached: false,
            }),
        }
    }
}

/// Split a filter into the levels leading to its node and whether it ends in `#`
fn split_filter(filter: &str) -> (SmallVec<[TopicLevel<'_>; 8]>, bool) {
    let mut levels: SmallVec<[TopicLevel<'_>; 8]> = parse_levels(filter).collect();
    let multi = levels.last() == Some(&TopicLevel::MultiWildcard);
    if multi {
        levels.pop();
    }
    (levels, multi)
}

/// Topic trie with per-node locking
pub struct TopicTrie<V> {
    root: Arc<TrieNode<V>>,
}

impl<V: NodeValue> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TrieNode::new()),
        }
    }

    /// Run `f` against the value stored for `filter`, creating the path and
    /// a default value if needed.
    ///
    /// The filter must already be validated.
    pub fn upsert<F, R>(&self, filter: &str, f: F) -> R
    where
        F: FnOnce(&mut V) -> R,
    {
        let (levels, multi) = split_filter(filter);

        'retry: loop {
            let mut node = self.root.clone();

            for &level in &levels {
                let existing = node.state.read().child(level).cloned();
                let next = match existing {
                    Some(child) => child,
                    None => {
                        let mut state = node.state.write();
                        if state.detached {
                            continue 'retry;
                        }
                        state.child_or_insert(level)
                    }
                };
                node = next;
            }

            let mut state = node.state.write();
            if state.detached {
                continue 'retry;
            }
            let value = state.slot(multi).get_or_insert_with(V::default);
            return f(value);
        }
    }

    /// Run `f` against the value stored for `filter`, if any.
    ///
    /// If the value is empty afterwards it is dropped, and every node on the
    /// path that became empty is pruned.
    pub fn modify<F, R>(&self, filter: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        let (levels, multi) = split_filter(filter);

        let mut path: SmallVec<[Arc<TrieNode<V>>; 8]> = SmallVec::with_capacity(levels.len() + 1);
        path.push(self.root.clone());
        for &level in &levels {
            let next = path.last()?.state.read().child(level).cloned()?;
            path.push(next);
        }

        let (result, emptied) = {
            let mut state = path.last()?.state.write();
            if state.detached {
                return None;
            }
            let slot = state.slot(multi);
            let value = slot.as_mut()?;
            let result = f(value);
            let emptied = value.is_empty();
            if emptied {
                *slot = None;
            }
            (result, emptied && state.is_empty())
        };

        if emptied {
            Self::prune_path(&path, &levels);
        }

        Some(result)
    }

    /// Unlink empty nodes along `path`, deepest first, stopping at the first
    /// node that is still in use.
    fn prune_path(path: &[Arc<TrieNode<V>>], levels: &[TopicLevel<'_>]) {
        for i in (1..path.len()).rev() {
            let mut parent = path[i - 1].state.write();
            if parent.detached {
                return;
            }
            let mut child = path[i].state.write();
            if child.detached || !child.is_empty() {
                return;
            }
            child.detached = true;
            parent.remove_child(levels[i - 1]);
        }
    }

    /// Apply `f` to every value in the trie, then prune empty values and nodes
    pub fn retain_all<F>(&self, mut f: F)
    where
        F: FnMut(&mut V),
    {
        Self::retain_recursive(&self.root, &mut f);
    }

    fn retain_recursive<F>(node: &TrieNode<V>, f: &mut F)
    where
        F: FnMut(&mut V),
    {
        let children: SmallVec<[Arc<TrieNode<V>>; 8]> = {
            let mut guard = node.state.write();
            let state = &mut *guard;
            for slot in [&mut state.value, &mut state.multi_wildcard] {
                if let Some(v) = slot.as_mut() {
                    f(v);
                    if v.is_empty() {
                        *slot = None;
                    }
                }
            }
            state
                .children
                .values()
                .chain(state.single_wildcard.iter())
                .cloned()
                .collect()
        };

        for child in &children {
            Self::retain_recursive(child, f);
        }

        let mut state = node.state.write();
        if state.detached {
            return;
        }
        if let Some(child) = state.single_wildcard.clone() {
            let mut child_state = child.state.write();
            if child_state.is_empty() {
                child_state.detached = true;
                drop(child_state);
                state.single_wildcard = None;
            }
        }
        state.children.retain(|_, child| {
            let mut child_state = child.state.write();
            if child_state.is_empty() {
                child_state.detached = true;
                false
            } else {
                true
            }
        });
    }

    /// Invoke `callback` for the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(is_system_topic && index == 0);

        let (single, literal) = {
            let state = node.state.read();

            // `#` also matches the parent level itself, so check it before
            // looking at whether the topic is exhausted
            if wildcards_allowed {
                if let Some(ref v) = state.multi_wildcard {
                    callback(v);
                }
            }

            if index >= levels.len() {
                if let Some(ref v) = state.value {
                    callback(v);
                }
                return;
            }

            let single = if wildcards_allowed {
                state.single_wildcard.clone()
            } else {
                None
            };
            (single, state.children.get(levels[index]).cloned())
        };

        if let Some(child) = single {
            Self::matches_recursive(&child, levels, index + 1, is_system_topic, callback);
        }
        if let Some(child) = literal {
            Self::matches_recursive(&child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        let children: SmallVec<[Arc<TrieNode<V>>; 8]> = {
            let state = node.state.read();
            if let Some(ref v) = state.value {
                callback(v);
            }
            if let Some(ref v) = state.multi_wildcard {
                callback(v);
            }
            state
                .children
                .values()
                .chain(state.single_wildcard.iter())
                .cloned()
                .collect()
        };

        for child in &children {
            Self::for_each_recursive(child, callback);
        }
    }

    /// Number of nodes below the root
    pub fn node_count(&self) -> usize {
        fn count<V>(node: &TrieNode<V>) -> usize {
            let state = node.state.read();
            state
                .children
                .values()
                .chain(state.single_wildcard.iter())
                .map(|child| 1 + count(child))
                .sum()
        }
        count(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.state.read().is_empty()
    }
}

impl<V: NodeValue> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn insert(trie: &TopicTrie<Vec<i32>>, filter: &str, value: i32) {
        trie.upsert(filter, |v| v.push(value));
    }

    fn collect(trie: &TopicTrie<Vec<i32>>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.extend_from_slice(v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let trie = TopicTrie::new();
        insert(&trie, "test/topic", 1);

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
        assert!(collect(&trie, "test").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let trie = TopicTrie::new();
        insert(&trie, "test/+", 1);
        insert(&trie, "+/topic", 2);
        insert(&trie, "+/+", 3);
        insert(&trie, "a/+/c", 4);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
        assert_eq!(collect(&trie, "a/b/c"), vec![4]);
        assert!(collect(&trie, "a/b/b/c").is_empty());
    }

    #[test]
    fn test_multi_wildcard_matches_parent_level() {
        let trie = TopicTrie::new();
        insert(&trie, "#", 1);
        insert(&trie, "a/#", 2);

        assert_eq!(collect(&trie, "a"), vec![1, 2]);
        assert_eq!(collect(&trie, "a/b"), vec![1, 2]);
        assert_eq!(collect(&trie, "a/b/c"), vec![1, 2]);
        assert_eq!(collect(&trie, "b"), vec![1]);
    }

    #[test]
    fn test_empty_levels_are_literal() {
        let trie = TopicTrie::new();
        insert(&trie, "/a", 1);
        insert(&trie, "a/", 2);
        insert(&trie, "a", 3);

        assert_eq!(collect(&trie, "/a"), vec![1]);
        assert_eq!(collect(&trie, "a/"), vec![2]);
        assert_eq!(collect(&trie, "a"), vec![3]);
    }

    #[test]
    fn test_system_topics() {
        let trie = TopicTrie::new();
        insert(&trie, "#", 1);
        insert(&trie, "+/test", 2);
        insert(&trie, "$SYS/#", 3);
        insert(&trie, "$SYS/+", 4);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3, 4]);
    }

    #[test]
    fn test_modify_prunes_empty_nodes() {
        let trie = TopicTrie::new();
        insert(&trie, "a/b/c", 1);
        insert(&trie, "a/+/#", 2);
        assert_eq!(trie.node_count(), 4);

        trie.modify("a/b/c", |v| v.retain(|x| *x != 1));
        assert_eq!(trie.node_count(), 2);
        assert!(collect(&trie, "a/b/c").contains(&2));

        trie.modify("a/+/#", |v| v.clear());
        assert_eq!(trie.node_count(), 0);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_modify_missing_filter() {
        let trie: TopicTrie<Vec<i32>> = TopicTrie::new();
        assert_eq!(trie.modify("x/y", |v| v.len()), None);

        insert(&trie, "x/y", 1);
        assert_eq!(trie.modify("x/#", |v| v.len()), None);
        assert_eq!(trie.modify("x/y", |v| v.len()), Some(1));
    }

    #[test]
    fn test_retain_all() {
        let trie = TopicTrie::new();
        insert(&trie, "a/b", 1);
        insert(&trie, "a/b", 2);
        insert(&trie, "c/#", 1);

        trie.retain_all(|v| v.retain(|x| *x != 1));
        assert_eq!(collect(&trie, "a/b"), vec![2]);
        assert!(collect(&trie, "c/d").is_empty());
        assert_eq!(trie.node_count(), 2);
    }

    #[test]
    fn test_concurrent_subscribe_and_match() {
        let trie = Arc::new(TopicTrie::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let trie = trie.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let filter = format!("site/{}/sensor/{}", w, i % 10);
                        insert(&trie, &filter, i);
                        trie.modify(&filter, |v| v.retain(|x| *x != i));
                    }
                    insert(&trie, &format!("site/{}/#", w), w);
                })
            })
            .collect();
        let reader = {
            let trie = trie.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let _ = collect(&trie, "site/1/sensor/3");
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        for w in 0..4 {
            assert_eq!(collect(&trie, &format!("site/{}/sensor/3", w)), vec![w]);
        }
    }
}
