//! Redis key schema.
//!
//! Durable store keys are namespaced by topic. Cached holder states live
//! under `cache:` and the recent holders list under `recent:`, so no holder
//! name can collide with the list.

/// Event log stream.
#[must_use]
pub fn events(topic: &str) -> String {
    format!("events:{}", topic)
}

/// Log head sequence.
#[must_use]
pub fn seq(topic: &str) -> String {
    format!("seq:{}", topic)
}

/// Indexer checkpoint.
#[must_use]
pub fn checkpoint(topic: &str) -> String {
    format!("checkpoint:{}", topic)
}

/// Materialized state of one holder.
#[must_use]
pub fn state(topic: &str, holder: &str) -> String {
    format!("state:{}:{}", topic, holder)
}

/// Set of holders with a state record.
#[must_use]
pub fn holders(topic: &str) -> String {
    format!("holders:{}", topic)
}

/// Token metadata.
#[must_use]
pub fn token(topic: &str) -> String {
    format!("token:{}", topic)
}

/// Retained window of block hashes.
#[must_use]
pub fn blocks(topic: &str) -> String {
    format!("blocks:{}", topic)
}

/// Provisional height appended by the listener.
#[must_use]
pub fn height(topic: &str) -> String {
    format!("height:{}", topic)
}

/// Lease lock for a process role.
#[must_use]
pub fn lock(role: &str, topic: &str) -> String {
    format!("lock:{}:{}", role, topic)
}

/// Cached state of one holder.
#[must_use]
pub fn cache_state(topic: &str, holder: &str) -> String {
    format!("cache:{}:{}", topic, holder)
}

/// Recently active holders.
#[must_use]
pub fn cache_recent(topic: &str) -> String {
    format!("recent:{}", topic)
}

/// Pattern matching every cached holder state of a topic.
#[must_use]
pub fn cache_pattern(topic: &str) -> String {
    format!("cache:{}:*", topic)
}
