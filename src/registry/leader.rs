//! Lease-based leadership lock.
//!
//! One key holds the owner's token for a TTL.  Only the owner can release
//! it; a crashed owner's lease simply expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::store::{Store, StoreError};

pub struct LeaderLock {
    store: Arc<dyn Store>,
    key: String,
    ttl: Duration,
    token: String,
}

impl LeaderLock {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            token: format!("{}_{}", std::process::id(), uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Take the lease if nobody holds it.  Never waits.
    pub async fn try_acquire(&self) -> Result<bool, StoreError> {
        let acquired = self.store.set_nx(&self.key, &self.token, self.ttl).await?;
        if acquired {
            info!(key = %self.key, ttl_secs = self.ttl.as_secs(), "leadership acquired");
        } else {
            debug!(key = %self.key, "leadership held elsewhere");
        }
        Ok(acquired)
    }

    /// Release the lease if this lock still owns it.
    pub async fn release(&self) -> Result<bool, StoreError> {
        let released = self.store.delete_if_equals(&self.key, &self.token).await?;
        if released {
            info!(key = %self.key, "leadership released");
        }
        Ok(released)
    }

    /// Whether anyone currently holds the lease.
    pub async fn is_held(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(&self.key).await?.is_some())
    }

    /// Poll until the lease is free.  Returns `false` once `attempts` polls
    /// (with `interval` between them) have all seen it held.
    pub async fn wait_for_release(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> Result<bool, StoreError> {
        for attempt in 0..attempts {
            if !self.is_held().await? {
                return Ok(true);
            }
            debug!(key = %self.key, attempt, "waiting for leader");
            tokio::time::sleep(interval).await;
        }
        Ok(!self.is_held().await?)
    }
}
