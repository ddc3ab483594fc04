use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `config.yaml`.
///
/// Every section has defaults, so an empty file yields a runnable
/// single-node setup backed by the in-memory store.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared data-structure store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Queue key names and dead-letter policy.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Worker loop tuning.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Capability registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Embedding backend.  Without it the registry cannot build or search.
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    /// Remote API gateway.  Optional; only needed to execute capabilities.
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// Outbound delivery channel.
    #[serde(default)]
    pub outbound: OutboundConfig,
    /// Optional HTTP monitoring endpoint.
    #[serde(default)]
    pub monitor: Option<MonitorConfig>,
    /// Log output settings.
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `redis://host:port/db` or `memory://`.
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_store_url() -> String {
    "memory://".to_string()
}

/// Key names and dead-letter policy for the work queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_inbound_stream")]
    pub inbound_stream: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_outbound_list")]
    pub outbound_list: String,
    #[serde(default = "default_schedule_set")]
    pub schedule_set: String,
    #[serde(default = "default_dead_letter_list")]
    pub dead_letter_list: String,
    #[serde(default = "default_permanent_list")]
    pub permanent_list: String,
    /// Dead letters re-queued this many times go to permanent storage.
    #[serde(default = "default_max_heal_retries")]
    pub max_heal_retries: u32,
    /// Entries processed per auto-heal pass.
    #[serde(default = "default_heal_batch")]
    pub heal_batch: usize,
    /// Retention of the permanent dead-letter list.
    #[serde(default = "default_permanent_ttl_days")]
    pub permanent_ttl_days: u64,
    /// Outbound deliveries are dropped once this many attempts are reached.
    #[serde(default = "default_max_outbound_attempts")]
    pub max_outbound_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbound_stream: default_inbound_stream(),
            consumer_group: default_consumer_group(),
            outbound_list: default_outbound_list(),
            schedule_set: default_schedule_set(),
            dead_letter_list: default_dead_letter_list(),
            permanent_list: default_permanent_list(),
            max_heal_retries: default_max_heal_retries(),
            heal_batch: default_heal_batch(),
            permanent_ttl_days: default_permanent_ttl_days(),
            max_outbound_attempts: default_max_outbound_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn permanent_ttl(&self) -> Duration {
        Duration::from_secs(self.permanent_ttl_days * 86_400)
    }
}

fn default_inbound_stream() -> String {
    "stream:inbound".to_string()
}
fn default_consumer_group() -> String {
    "workers".to_string()
}
fn default_outbound_list() -> String {
    "queue:outbound".to_string()
}
fn default_schedule_set() -> String {
    "schedule_retry".to_string()
}
fn default_dead_letter_list() -> String {
    "dlq:inbound".to_string()
}
fn default_permanent_list() -> String {
    "dlq:permanent".to_string()
}
fn default_max_heal_retries() -> u32 {
    3
}
fn default_heal_batch() -> usize {
    10
}
fn default_permanent_ttl_days() -> u64 {
    14
}
fn default_max_outbound_attempts() -> u32 {
    5
}

/// Worker loop tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Number of worker tasks in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Entries claimed per read.
    #[serde(default = "default_claim_count")]
    pub claim_count: usize,
    /// Blocking wait for new inbound entries, in milliseconds.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Blocking wait for outbound messages, in milliseconds.
    #[serde(default = "default_block_ms")]
    pub outbound_block_ms: u64,
    /// Messages allowed per sender per window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: i64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Stalled-entry scan period, in loop ticks.
    #[serde(default = "default_reclaim_every_ticks")]
    pub reclaim_every_ticks: u64,
    /// Entries owned longer than this without an ack are reclaimable.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_reclaim_batch")]
    pub reclaim_batch: usize,
    /// Dead-letter auto-heal period, in loop ticks.
    #[serde(default = "default_heal_every_ticks")]
    pub heal_every_ticks: u64,
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive failing ticks before the worker gives up.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_tick_pause_ms")]
    pub tick_pause_ms: u64,
    #[serde(default = "default_error_pause_ms")]
    pub error_pause_ms: u64,
    /// Reply sent to a sender whose message could not be processed.
    /// `None` disables the reply.
    #[serde(default = "default_failure_reply")]
    pub failure_reply: Option<String>,
    /// How long shutdown waits for workers to finish their current tick.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            claim_count: default_claim_count(),
            block_ms: default_block_ms(),
            outbound_block_ms: default_block_ms(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            reclaim_every_ticks: default_reclaim_every_ticks(),
            idle_threshold_secs: default_idle_threshold_secs(),
            reclaim_batch: default_reclaim_batch(),
            heal_every_ticks: default_heal_every_ticks(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
            tick_pause_ms: default_tick_pause_ms(),
            error_pause_ms: default_error_pause_ms(),
            failure_reply: default_failure_reply(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_claim_count() -> usize {
    5
}
fn default_block_ms() -> u64 {
    1000
}
fn default_rate_limit_max() -> i64 {
    20
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_reclaim_every_ticks() -> u64 {
    100
}
fn default_idle_threshold_secs() -> u64 {
    300
}
fn default_reclaim_batch() -> usize {
    10
}
fn default_heal_every_ticks() -> u64 {
    300
}
fn default_heartbeat_ttl_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_max_consecutive_errors() -> u32 {
    10
}
fn default_tick_pause_ms() -> u64 {
    10
}
fn default_error_pause_ms() -> u64 {
    1000
}
fn default_failure_reply() -> Option<String> {
    Some("Sorry, something went wrong while handling your message. Please try again shortly.".to_string())
}
fn default_drain_timeout_secs() -> u64 {
    30
}

/// A remote API description to ingest.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Service name; used as the path prefix when the document has no base path.
    pub service: String,
    /// URL of the OpenAPI / Swagger JSON document.
    pub url: String,
}

/// Operations excluded from the registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DenyListConfig {
    /// Exact operation ids.
    #[serde(default = "default_deny_names")]
    pub names: Vec<String>,
    /// Case-insensitive substrings matched against operation id and path.
    #[serde(default = "default_deny_patterns")]
    pub patterns: Vec<String>,
}

impl Default for DenyListConfig {
    fn default() -> Self {
        Self {
            names: default_deny_names(),
            patterns: default_deny_patterns(),
        }
    }
}

fn default_deny_names() -> Vec<String> {
    [
        "post_VehicleAssignments",
        "get_VehicleAssignments",
        "post_Booking",
        "post_Batch",
        "get_WhatCanIDo",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_deny_patterns() -> Vec<String> {
    [
        "batch",
        "excel",
        "export",
        "import",
        "internal",
        "count",
        "projectto",
        "searchinfo",
        "odata",
        "whatcanido",
        "multipatch",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Capability registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Directory for the snapshot files.  Defaults to `<relay home>/registry`.
    #[serde(default)]
    pub snapshot_dir: Option<String>,
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_follower_poll_attempts")]
    pub follower_poll_attempts: u32,
    #[serde(default = "default_follower_poll_interval_secs")]
    pub follower_poll_interval_secs: u64,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    /// Pause between embedding batches, in milliseconds.
    #[serde(default = "default_embedding_pause_ms")]
    pub embedding_pause_ms: u64,
    /// Persist a checkpoint after this many newly generated vectors.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Source refresh period; `0` disables periodic refresh.
    #[serde(default = "default_auto_update_secs")]
    pub auto_update_secs: u64,
    /// TTL of cached search results.
    #[serde(default = "default_search_cache_ttl_secs")]
    pub search_cache_ttl_secs: u64,
    #[serde(default)]
    pub deny: DenyListConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            snapshot_dir: None,
            lock_key: default_lock_key(),
            lock_ttl_secs: default_lock_ttl_secs(),
            follower_poll_attempts: default_follower_poll_attempts(),
            follower_poll_interval_secs: default_follower_poll_interval_secs(),
            fetch_attempts: default_fetch_attempts(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_pause_ms: default_embedding_pause_ms(),
            checkpoint_every: default_checkpoint_every(),
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
            auto_update_secs: default_auto_update_secs(),
            search_cache_ttl_secs: default_search_cache_ttl_secs(),
            deny: DenyListConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Resolve the directory holding the live and backup snapshot files.
    pub fn snapshot_dir(&self) -> PathBuf {
        match &self.snapshot_dir {
            Some(dir) => {
                let p = PathBuf::from(dir);
                if p.is_relative() {
                    crate::relay_home().join(p)
                } else {
                    p
                }
            }
            None => crate::relay_home().join("registry"),
        }
    }
}

fn default_lock_key() -> String {
    "tool_registry_leader_lock".to_string()
}
fn default_lock_ttl_secs() -> u64 {
    900
}
fn default_follower_poll_attempts() -> u32 {
    120
}
fn default_follower_poll_interval_secs() -> u64 {
    5
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_embedding_batch_size() -> usize {
    5
}
fn default_embedding_pause_ms() -> u64 {
    50
}
fn default_checkpoint_every() -> usize {
    20
}
fn default_similarity_threshold() -> f64 {
    0.60
}
fn default_top_k() -> usize {
    5
}
fn default_auto_update_secs() -> u64 {
    3600
}
fn default_search_cache_ttl_secs() -> u64 {
    300
}

/// Embedding backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// `openai` (any OpenAI-compatible endpoint) or `azure-openai`.
    pub provider: String,
    /// API key (plain text or env-var reference like `$OPENAI_API_KEY`).
    pub api_key: String,
    /// Embeddings URL for `openai`, resource URL for `azure-openai`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model name sent in the request body (`openai`).
    #[serde(default)]
    pub model: Option<String>,
    /// Azure embedding deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    /// Azure API version.
    #[serde(default)]
    pub api_version: Option<String>,
}

/// Remote API gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL prefixed to every capability path.
    pub base_url: String,
    /// OAuth2 token endpoint (client-credentials grant).
    pub auth_url: String,
    pub client_id: String,
    /// Client secret (plain text or env-var reference).
    pub client_secret: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// Default tenant sent as `x-tenant` and auto-injected as `tenantId`.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_token_key")]
    pub token_key: String,
    #[serde(default = "default_token_lock_key")]
    pub token_lock_key: String,
}

fn default_gateway_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}
fn default_token_key() -> String {
    "gateway:access_token".to_string()
}
fn default_token_lock_key() -> String {
    "gateway:token_refresh_lock".to_string()
}

/// Outbound delivery channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutboundConfig {
    /// Replies are POSTed here as JSON.  Without it replies are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Value of the `Authorization` header (plain text or env-var reference).
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_bind")]
    pub bind: String,
}

fn default_monitor_bind() -> String {
    "127.0.0.1:8001".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Secret references
// ---------------------------------------------------------------------------

/// Resolve a secret reference.
///
/// `$NAME` and `@NAME` read the environment variable `NAME`; anything else
/// is returned as-is.
pub fn resolve_secret(raw: &str) -> anyhow::Result<String> {
    let name = raw.strip_prefix('$').or_else(|| raw.strip_prefix('@'));
    match name {
        Some(name) if !name.is_empty() => std::env::var(name)
            .with_context(|| format!("environment variable {name} is not set")),
        _ => Ok(raw.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Read, parse and validate a YAML configuration file.
    ///
    /// Falls back to `<path>.bak` when the file is missing.  Secret
    /// references are resolved after parsing.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bak_name = path.as_os_str().to_os_string();
                bak_name.push(".bak");
                let bak_path = PathBuf::from(bak_name);
                match tokio::fs::read_to_string(&bak_path).await {
                    Ok(c) => {
                        tracing::warn!(
                            path = %path.display(),
                            bak = %bak_path.display(),
                            "config file not found, falling back to .bak"
                        );
                        c
                    }
                    Err(_) => {
                        return Err(e).with_context(|| {
                            format!("failed to read config file: {}", path.display())
                        });
                    }
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let mut config = Self::from_yaml(&contents)?;
        config.resolve_secrets()?;

        tracing::debug!(
            sources = config.registry.sources.len(),
            workers = config.worker.concurrency,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate YAML without touching secrets or the filesystem.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(contents).context("failed to parse config YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    fn resolve_secrets(&mut self) -> anyhow::Result<()> {
        if let Some(emb) = self.embedding.as_mut() {
            emb.api_key = resolve_secret(&emb.api_key).context("config: embedding.api_key")?;
        }
        if let Some(gw) = self.gateway.as_mut() {
            gw.client_secret =
                resolve_secret(&gw.client_secret).context("config: gateway.client_secret")?;
        }
        if let Some(header) = self.outbound.auth_header.as_mut() {
            *header = resolve_secret(header).context("config: outbound.auth_header")?;
        }
        Ok(())
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        let w = &self.worker;
        if w.concurrency == 0 {
            anyhow::bail!("config: worker.concurrency must be at least 1");
        }
        if w.block_ms == 0 || w.outbound_block_ms == 0 {
            anyhow::bail!("config: worker.block_ms and outbound_block_ms must be at least 1");
        }
        if w.claim_count == 0 {
            anyhow::bail!("config: worker.claim_count must be at least 1");
        }
        if w.reclaim_every_ticks == 0 || w.heal_every_ticks == 0 {
            anyhow::bail!("config: worker maintenance periods must be non-zero");
        }
        if w.heartbeat_interval_secs >= w.heartbeat_ttl_secs {
            anyhow::bail!(
                "config: worker.heartbeat_interval_secs ({}) must be shorter than heartbeat_ttl_secs ({})",
                w.heartbeat_interval_secs,
                w.heartbeat_ttl_secs
            );
        }
        if w.max_consecutive_errors == 0 {
            anyhow::bail!("config: worker.max_consecutive_errors must be at least 1");
        }

        let r = &self.registry;
        if r.lock_ttl_secs == 0 {
            anyhow::bail!("config: registry.lock_ttl_secs must be non-zero");
        }
        if r.embedding_batch_size == 0 || r.checkpoint_every == 0 {
            anyhow::bail!("config: registry batch and checkpoint sizes must be non-zero");
        }
        if !(-1.0..=1.0).contains(&r.similarity_threshold) {
            anyhow::bail!(
                "config: registry.similarity_threshold {} is outside [-1, 1]",
                r.similarity_threshold
            );
        }
        let mut urls = HashSet::new();
        for source in &r.sources {
            if !urls.insert(source.url.as_str()) {
                anyhow::bail!("config: duplicate registry source url: {}", source.url);
            }
            if source.service.trim().is_empty() {
                anyhow::bail!("config: registry source {} has an empty service", source.url);
            }
        }

        if let Some(emb) = &self.embedding {
            match emb.provider.as_str() {
                "openai" => {}
                "azure-openai" => {
                    if emb.endpoint.is_none() || emb.deployment.is_none() {
                        anyhow::bail!(
                            "config: azure-openai embedding needs endpoint and deployment"
                        );
                    }
                }
                other => anyhow::bail!("config: unknown embedding provider '{other}'"),
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.base_url.trim().is_empty() {
                anyhow::bail!("config: gateway.base_url is empty");
            }
            if gw.breaker_failure_threshold == 0 {
                anyhow::bail!("config: gateway.breaker_failure_threshold must be at least 1");
            }
        }

        if self.queue.max_outbound_attempts == 0 {
            anyhow::bail!("config: queue.max_outbound_attempts must be at least 1");
        }

        Ok(())
    }
}
