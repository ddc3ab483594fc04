//! Fail-open cache over the shared store.
//!
//! A store outage must never break the caller: read failures are misses,
//! write failures are logged and ignored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::store::{Store, StoreExt};

/// JSON cache with a key prefix.
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn Store>,
    prefix: String,
}

impl CacheService {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        match self.store.get_json::<T>(&self.key(key)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(e) = self.store.set_json(&self.key(key), value, Some(ttl)).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.key(key)).await {
            warn!(key, error = %e, "cache delete failed");
        }
    }

    /// Return the cached value or compute, store and return a fresh one.
    /// Errors from `compute` propagate and are not cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let fresh = compute().await?;
        self.set(key, &fresh, ttl).await;
        Ok(fresh)
    }
}
