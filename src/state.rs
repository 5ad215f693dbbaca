//! Server state management.
//!
//! Holds the topic cache, the publish gate and the access guard. Everything is
//! built once at startup and shared by reference between the broker listener
//! (the only cache writer) and the HTTP request handlers.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::AccessGuard;
use crate::broker::Publisher;
use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::topic;

/// Default realm announced in the `WWW-Authenticate` challenge.
pub const DEFAULT_REALM: &str = "mqtt-rest-relay";

/// Last known payload of a subscribed topic. `None` until the first message.
pub type CachedMessage = Option<String>;

// ── Topic Cache ───────────────────────────────────────────────────────────────

/// Resource path → last payload received on the matching subscription.
///
/// Backed by a DashMap so the broker event loop can write while any number of
/// request handlers read. Each entry is replaced whole, so readers see either
/// the old or the new payload.
#[derive(Clone, Default)]
pub struct TopicCache {
    entries: Arc<DashMap<String, CachedMessage>>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription path as "no message yet".
    /// An existing entry is left untouched.
    pub fn register(&self, path: &str) {
        self.entries.entry(path.to_string()).or_insert(None);
    }

    /// Look up a path.
    ///
    /// - `None` → path was never registered
    /// - `Some(None)` → registered, nothing received yet
    /// - `Some(Some(payload))` → last received payload
    pub fn get(&self, path: &str) -> Option<CachedMessage> {
        self.entries.get(path).map(|entry| entry.value().clone())
    }

    /// Store a payload, replacing whatever was there (last write wins).
    pub fn set(&self, path: &str, payload: String) {
        self.entries.insert(path.to_string(), Some(payload));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Relay State ───────────────────────────────────────────────────────────────

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Subscribed paths and their last payloads.
    pub cache: TopicCache,

    /// Paths that may trigger an outbound publish. Never mutated after startup.
    pub publish_gate: Arc<HashSet<String>>,

    /// Global HTTP Basic guard.
    pub guard: Arc<AccessGuard>,

    /// Outbound publish path. None when no broker is attached.
    pub publisher: Option<Arc<dyn Publisher>>,

    /// Realm used in the 401 challenge.
    pub realm: Arc<str>,

    /// Largest POST body that is read and published.
    pub max_body_bytes: usize,
}

impl RelayState {
    /// Create the relay state. `publish_topics` must already be filtered.
    pub fn new(cache: TopicCache, publish_topics: &[String], guard: AccessGuard) -> Self {
        let publish_gate: HashSet<String> = publish_topics
            .iter()
            .map(|t| {
                tracing::info!(topic = t.as_str(), "Enabling publishing to topic");
                topic::resource_path(t)
            })
            .collect();

        Self {
            cache,
            publish_gate: Arc::new(publish_gate),
            guard: Arc::new(guard),
            publisher: None,
            realm: Arc::from(DEFAULT_REALM),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Attach the outbound publisher (normally the broker handle).
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Arc::from(realm);
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Check whether a path is in the publish gate.
    pub fn is_publishable(&self, path: &str) -> bool {
        self.publish_gate.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_vs_silent_topic() {
        let cache = TopicCache::new();
        cache.register("/sensors/temp");

        assert_eq!(cache.get("/sensors/temp"), Some(None));
        assert_eq!(cache.get("/sensors/humidity"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = TopicCache::new();
        cache.register("/sensors/temp");

        cache.set("/sensors/temp", "21.0".to_string());
        cache.set("/sensors/temp", "23.5".to_string());

        assert_eq!(cache.get("/sensors/temp"), Some(Some("23.5".to_string())));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_register_keeps_existing_payload() {
        let cache = TopicCache::new();
        cache.set("/sensors/temp", "23.5".to_string());
        cache.register("/sensors/temp");

        assert_eq!(cache.get("/sensors/temp"), Some(Some("23.5".to_string())));
    }

    #[test]
    fn test_concurrent_reads_never_observe_torn_values() {
        let cache = TopicCache::new();
        cache.register("/sensors/blob");

        let a = "a".repeat(4096);
        let b = "b".repeat(4096);

        let writer = {
            let cache = cache.clone();
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let payload = if i % 2 == 0 { a.clone() } else { b.clone() };
                    cache.set("/sensors/blob", payload);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let (a, b) = (a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        match cache.get("/sensors/blob") {
                            Some(None) => {}
                            Some(Some(value)) => assert!(value == a || value == b),
                            None => panic!("registered topic disappeared"),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_publish_gate_uses_resource_paths() {
        let state = RelayState::new(
            TopicCache::new(),
            &["actors/valve".to_string()],
            AccessGuard::disabled(),
        );

        assert!(state.is_publishable("/actors/valve"));
        assert!(!state.is_publishable("actors/valve"));
        assert!(!state.is_publishable("/actors/pump"));
        assert!(state.publisher.is_none());
        assert_eq!(&*state.realm, DEFAULT_REALM);
        assert_eq!(state.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(state.with_max_body_bytes(16).max_body_bytes, 16);
    }
}
