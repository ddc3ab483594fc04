//! Data-structure store abstraction.
//!
//! Everything the relay shares between processes (queues, locks, rate
//! limit windows, heartbeats, cached tokens) goes through the [`Store`]
//! trait.  The primitive set mirrors a Redis server: strings with TTL,
//! lists, sorted sets and streams with consumer groups.
//!
//! Two backends ship with the crate:
//! - [`MemoryStore`]: in-process, used by tests and single-node runs
//! - [`RedisStore`]: any Redis-compatible server
//!
//! Use [`connect`] to pick one from a URL (`memory://` or `redis://…`).

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for [`Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Stream types
// ---------------------------------------------------------------------------

/// One entry read from a stream: its id plus the field map in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Shared state and coordination substrate.
///
/// Implementations must make every method atomic with respect to other
/// callers of the same store, including callers in other processes.
#[async_trait]
pub trait Store: Send + Sync {
    // -- strings -------------------------------------------------------------

    /// Get a string value, `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a value only if the key does not exist.  Returns `true` when
    /// this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a key.  Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Increment a counter and (re)arm its expiry as one atomic unit.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    /// Set a TTL on an existing key.  Returns `false` when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    // -- lists ---------------------------------------------------------------

    /// Append to the tail of a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Pop from the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pop from the head of a list, waiting up to `timeout` for an element.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Inclusive range; negative indices count from the tail.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    // -- sorted sets ---------------------------------------------------------

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Members with `score <= max`, lowest score first, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove a member.  Returns `true` if this call removed it.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    // -- streams -------------------------------------------------------------

    /// Create a consumer group (and the stream) if missing.  The group
    /// starts at the beginning of the stream.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Append an entry, returning its id.
    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StoreError>;

    /// Read up to `count` never-delivered entries for `consumer`, blocking
    /// at most `block` when none are available.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge an entry, removing it from the pending list.
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError>;

    /// Delete an entry from the stream.
    async fn xdel(&self, stream: &str, id: &str) -> Result<bool, StoreError>;

    async fn xlen(&self, stream: &str) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Extension trait with JSON convenience methods.
#[async_trait]
pub trait StoreExt: Store {
    /// Get a value and deserialize it from JSON.
    async fn get_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Serialize a value to JSON and store it.
    async fn set_json<T: serde::Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.set(key, &raw, ttl).await
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Open a store from a URL.
///
/// `memory://` yields a fresh [`MemoryStore`]; `redis://` and `rediss://`
/// connect to a Redis-compatible server.
pub async fn connect(url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if url.starts_with("memory://") {
        tracing::warn!("using in-process memory store; state is not shared between processes");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    anyhow::bail!("unsupported store url scheme: {url}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_entry_field_lookup() {
        let entry = StreamEntry {
            id: "1-0".into(),
            fields: vec![
                ("sender".into(), "+385900000".into()),
                ("text".into(), "status?".into()),
            ],
        };
        assert_eq!(entry.field("text"), Some("status?"));
        assert_eq!(entry.field("missing"), None);
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = MemoryStore::new();
        store
            .set_json("k", &serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        let v: Option<serde_json::Value> = store.get_json("k").await.unwrap();
        assert_eq!(v.unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        assert!(connect("ftp://nope").await.is_err());
        assert!(connect("memory://").await.is_ok());
    }
}
