//! Topic validation and resource path mapping.
//!
//! Only plain topic names are bridged. Anything carrying the MQTT wildcard
//! markers (`+` single-level, `#` multi-level) is rejected at startup and
//! never reaches the cache, the publish gate, or the broker.

/// Prefix joining a topic to its HTTP resource path.
pub const PATH_SEPARATOR: char = '/';

const WILDCARDS: [char; 2] = ['+', '#'];

/// What a configured topic is going to be used for (only affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    Subscribe,
    Publish,
}

/// True if the topic can be bridged: non-empty and free of wildcards.
pub fn is_bridgeable(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(WILDCARDS)
}

/// `sensors/temp` → `/sensors/temp`
pub fn resource_path(topic: &str) -> String {
    let mut path = String::with_capacity(topic.len() + 1);
    path.push(PATH_SEPARATOR);
    path.push_str(topic);
    path
}

/// Inverse of [`resource_path`]. Returns `None` for paths without the prefix.
pub fn topic_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(PATH_SEPARATOR)
}

/// Split a whitespace-separated topic list, dropping (and warning about)
/// wildcard topics. Duplicates are collapsed, first occurrence wins.
pub fn accept_topics(raw: &str, role: TopicRole) -> Vec<String> {
    let mut accepted: Vec<String> = Vec::new();

    for topic in raw.split_whitespace() {
        if !is_bridgeable(topic) {
            match role {
                TopicRole::Subscribe => {
                    tracing::warn!(topic = topic, "Ignoring subscription to unsupported topic")
                }
                TopicRole::Publish => {
                    tracing::warn!(topic = topic, "Ignoring unsupported topic for publishing")
                }
            }
            continue;
        }

        if accepted.iter().any(|t| t == topic) {
            continue;
        }
        accepted.push(topic.to_string());
    }

    accepted
}
