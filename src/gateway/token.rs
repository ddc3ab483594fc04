//! Bearer token management for the remote API.
//!
//! Tokens come from an OAuth2 client-credentials grant.  A fresh token is
//! cached locally and shared through the store so a fleet of workers
//! fetches one token, not one each.  Refreshes are serialized across
//! processes with a short lease lock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::store::{Store, StoreExt};

/// Local copies are refreshed this long before expiry.
const LOCAL_MARGIN_SECS: i64 = 60;
/// The shared copy expires this long before the token does.
const SHARED_MARGIN_SECS: i64 = 120;
const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_WAIT_POLLS: u32 = 10;
const LOCK_WAIT_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedToken {
    token: String,
    /// UNIX seconds.
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Utc::now().timestamp() < self.expires_at - LOCAL_MARGIN_SECS
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

pub struct TokenManager {
    store: Arc<dyn Store>,
    http: Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    audience: Option<String>,
    token_key: String,
    lock_key: String,
    local: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>, http: Client, cfg: &GatewayConfig) -> Self {
        Self {
            store,
            http,
            auth_url: cfg.auth_url.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            scope: cfg.scope.clone(),
            audience: cfg.audience.clone(),
            token_key: cfg.token_key.clone(),
            lock_key: cfg.token_lock_key.clone(),
            local: Mutex::new(None),
        }
    }

    /// A valid bearer token: local cache, then shared cache, then a fresh
    /// grant.
    pub async fn token(&self) -> anyhow::Result<String> {
        let mut local = self.local.lock().await;
        if let Some(cached) = local.as_ref().filter(|c| c.is_fresh()) {
            return Ok(cached.token.clone());
        }

        if let Some(shared) = self.read_shared().await {
            let token = shared.token.clone();
            *local = Some(shared);
            return Ok(token);
        }

        let lock_owner = uuid::Uuid::new_v4().to_string();
        let holds_lock = match self
            .store
            .set_nx(&self.lock_key, &lock_owner, REFRESH_LOCK_TTL)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "token refresh lock unavailable, refreshing anyway");
                true
            }
        };

        if !holds_lock {
            for _ in 0..LOCK_WAIT_POLLS {
                tokio::time::sleep(LOCK_WAIT_INTERVAL).await;
                if let Some(shared) = self.read_shared().await {
                    let token = shared.token.clone();
                    *local = Some(shared);
                    return Ok(token);
                }
            }
            debug!("token refresh by another worker did not land, fetching directly");
        }

        let fetched = self.fetch().await;
        if holds_lock {
            if let Err(e) = self.store.delete_if_equals(&self.lock_key, &lock_owner).await {
                warn!(error = %e, "failed to release token refresh lock");
            }
        }
        let (fresh, expires_in) = fetched?;

        let shared_ttl = expires_in - SHARED_MARGIN_SECS;
        if shared_ttl > 0 {
            if let Err(e) = self
                .store
                .set_json(
                    &self.token_key,
                    &fresh,
                    Some(Duration::from_secs(shared_ttl as u64)),
                )
                .await
            {
                warn!(error = %e, "failed to share access token");
            }
        }
        let token = fresh.token.clone();
        *local = Some(fresh);
        Ok(token)
    }

    async fn read_shared(&self) -> Option<CachedToken> {
        match self.store.get_json::<CachedToken>(&self.token_key).await {
            Ok(Some(t)) if t.is_fresh() => Some(t),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "shared token read failed");
                None
            }
        }
    }

    async fn fetch(&self) -> anyhow::Result<(CachedToken, i64)> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }
        if let Some(audience) = &self.audience {
            form.push(("audience", audience.as_str()));
        }

        let resp = self
            .http
            .post(&self.auth_url)
            .form(&form)
            .send()
            .await
            .context("token request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "token endpoint returned {status}: {}",
                crate::utils::truncate_str(&body, 200)
            );
        }
        let parsed: TokenResponse = resp.json().await.context("decode token response")?;
        info!(expires_in = parsed.expires_in, "access token refreshed");
        Ok((
            CachedToken {
                token: parsed.access_token,
                expires_at: Utc::now().timestamp() + parsed.expires_in,
            },
            parsed.expires_in,
        ))
    }

    /// Forget a token the API rejected.  The shared copy is deleted only
    /// if it still holds that same token.
    pub async fn invalidate(&self, rejected: &str) {
        let mut local = self.local.lock().await;
        if local.as_ref().is_some_and(|c| c.token == rejected) {
            *local = None;
        }
        drop(local);

        match self.store.get(&self.token_key).await {
            Ok(Some(raw)) => {
                let same = serde_json::from_str::<CachedToken>(&raw)
                    .map(|c| c.token == rejected)
                    .unwrap_or(true);
                if same {
                    if let Err(e) = self.store.delete_if_equals(&self.token_key, &raw).await {
                        warn!(error = %e, "failed to drop shared token");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "shared token read failed during invalidate"),
        }
    }
}
