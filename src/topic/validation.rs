//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the whole last level
//! - Single-level wildcard (+) must occupy a whole level
//! - Topics starting with $ are not matched by a leading + or #

/// Prefix of a shared subscription filter
pub const SHARE_PREFIX: &str = "$share/";

/// Maximum encoded length of a topic name or filter
const MAX_TOPIC_LEN: usize = 65535;

/// Represents a level in a topic filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicLevel<'a> {
    /// Literal level (may be empty)
    Literal(&'a str),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

impl<'a> TopicLevel<'a> {
    pub fn parse(level: &'a str) -> Self {
        match level {
            "+" => TopicLevel::SingleWildcard,
            "#" => TopicLevel::MultiWildcard,
            s => TopicLevel::Literal(s),
        }
    }
}

/// Parse a filter into levels
pub fn parse_levels(filter: &str) -> impl Iterator<Item = TopicLevel<'_>> {
    filter.split('/').map(TopicLevel::parse)
}

/// Split a shared subscription filter.
/// Returns (share_group, actual_filter) for `$share/{group}/{filter}`, or None
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix(SHARE_PREFIX)?;
    let (group, actual) = rest.split_once('/')?;
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some((group, actual))
}

/// Validate a topic name (used for publishes)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    validate_topic_name_with_max_levels(topic, 0)
}

/// Validate a topic name with configurable max levels (0 = unlimited)
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    if max_topic_levels > 0 && topic.split('/').count() > max_topic_levels {
        return Err("topic exceeds maximum allowed levels");
    }

    Ok(())
}

/// Validate a topic filter (used for subscribe/unsubscribe)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter with configurable max levels (0 = unlimited).
///
/// Shared subscriptions (`$share/{group}/{filter}`) are accepted; only the
/// filter part counts towards the level limit.
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let actual_filter = match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => {
            let Some((group, actual)) = rest.split_once('/') else {
                return Err("invalid shared subscription format");
            };
            if group.is_empty() {
                return Err("shared subscription group name cannot be empty");
            }
            if group.contains(['+', '#']) {
                return Err("shared subscription group name cannot contain wildcards");
            }
            if actual.is_empty() {
                return Err("shared subscription filter cannot be empty");
            }
            actual
        }
        None => filter,
    };

    let level_count = actual_filter.split('/').count();
    if max_topic_levels > 0 && level_count > max_topic_levels {
        return Err("topic filter exceeds maximum allowed levels");
    }

    for (i, level) in actual_filter.split('/').enumerate() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i + 1 != level_count {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name by walking both level lists.
///
/// This is the reference matcher the trie is checked against.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');

    for level in parse_levels(filter) {
        match level {
            TopicLevel::MultiWildcard => return true,
            TopicLevel::SingleWildcard => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            TopicLevel::Literal(lit) => match topic_levels.next() {
                Some(t) if t == lit => {}
                _ => return false,
            },
        }
    }

    topic_levels.next().is_none()
}
