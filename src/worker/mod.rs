//! Worker pool and recovery loop.
//!
//! Each worker repeatedly runs one tick:
//! - claim new inbound entries and process them
//! - deliver one outbound message
//! - promote due scheduled retries
//!
//! The three run concurrently within the tick.  Periodically the worker
//! also reclaims entries another worker left stalled and heals the
//! dead-letter list.  Too many consecutive failing ticks mean the store is
//! gone, and the worker stops with an error instead of spinning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheService;
use crate::config::{OutboundConfig, WorkerConfig};
use crate::queue::{
    DeadLetterEntry, InboundMessage, OutboundMessage, OutboundPop, QueueService, RetryDecision,
};
use crate::registry::CapabilityRegistry;
use crate::store::StreamEntry;
use crate::utils::{mask_sender, truncate_str, unix_now};

/// Scheduled retries promoted per tick.
const PROMOTE_PER_TICK: usize = 5;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Business processing of one inbound message.  `Some(reply)` is sent
/// back to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &InboundMessage) -> anyhow::Result<Option<String>>;
}

/// Delivery of one outbound message over the reply channel.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;
}

/// Search hit as cached by [`CapabilityHandler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedHit {
    operation_id: String,
    method: String,
    path: String,
    description: String,
    score: f64,
}

/// Answers each message with the best-matching registry capabilities.
///
/// It only ranks; nothing is executed on the sender's behalf.  Remote
/// calls go through [`crate::gateway::RemoteGateway`], which operators
/// reach with `relay registry call`.
pub struct CapabilityHandler {
    registry: Arc<CapabilityRegistry>,
    cache: CacheService,
    top_k: usize,
    cache_ttl: Duration,
}

impl CapabilityHandler {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        cache: CacheService,
        top_k: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            top_k,
            cache_ttl,
        }
    }
}

#[async_trait]
impl MessageHandler for CapabilityHandler {
    async fn handle(&self, msg: &InboundMessage) -> anyhow::Result<Option<String>> {
        let query = msg.text.trim().to_lowercase();
        let key = format!(
            "search:{}:{}",
            self.registry.status().generation,
            crate::registry::descriptor::sha256_hex(query.as_bytes())
        );
        let registry = self.registry.clone();
        let top_k = self.top_k;
        let hits: Vec<CachedHit> = self
            .cache
            .get_or_compute(&key, self.cache_ttl, || async move {
                Ok(registry
                    .find_relevant(&query, top_k)
                    .await
                    .into_iter()
                    .map(|h| CachedHit {
                        operation_id: h.descriptor.operation_id.clone(),
                        method: h.descriptor.method.to_string(),
                        path: h.descriptor.path.clone(),
                        description: truncate_str(&h.descriptor.description, 120),
                        score: h.score,
                    })
                    .collect())
            })
            .await?;

        if hits.is_empty() {
            return Ok(Some(
                "I could not find an operation matching your request.".to_string(),
            ));
        }
        let mut reply = String::from("Closest matching operations:");
        for (i, hit) in hits.iter().enumerate() {
            reply.push_str(&format!(
                "\n{}. {} ({} {}, score {:.2}): {}",
                i + 1,
                hit.operation_id,
                hit.method,
                hit.path,
                hit.score,
                hit.description
            ));
        }
        Ok(Some(reply))
    }
}

/// POSTs each outbound message as JSON to a webhook.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
}

impl WebhookSender {
    pub fn new(url: String, cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(15)))
            .build()
            .context("build webhook HTTP client")?;
        Ok(Self {
            client,
            url,
            auth_header: cfg.auth_header.clone(),
        })
    }
}

#[async_trait]
impl OutboundSender for WebhookSender {
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        let mut req = self.client.post(&self.url).json(msg);
        if let Some(auth) = &self.auth_header {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        let resp = req.send().await.context("webhook request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

/// Logs outbound messages instead of sending them.
pub struct LogSender;

#[async_trait]
impl OutboundSender for LogSender {
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        info!(
            to = %mask_sender(&msg.to),
            correlation_id = %msg.correlation_id,
            text = %truncate_str(&msg.text, 200),
            "outbound message"
        );
        Ok(())
    }
}

/// Pick the webhook sender when configured, else the log sender.
pub fn sender_from_config(cfg: &OutboundConfig) -> anyhow::Result<Arc<dyn OutboundSender>> {
    Ok(match &cfg.webhook_url {
        Some(url) => Arc::new(WebhookSender::new(url.clone(), cfg)?),
        None => {
            warn!("no outbound webhook configured, replies will only be logged");
            Arc::new(LogSender)
        }
    })
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters shared by every worker in the process.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub malformed: AtomicU64,
    pub reclaimed: AtomicU64,
    pub delivered: AtomicU64,
    pub delivery_failed: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub retries_dropped: AtomicU64,
    pub healed_requeued: AtomicU64,
    pub healed_permanent: AtomicU64,
    pub loop_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub malformed: u64,
    pub reclaimed: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub retries_scheduled: u64,
    pub retries_dropped: u64,
    pub healed_requeued: u64,
    pub healed_permanent: u64,
    pub loop_errors: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerStatsSnapshot {
            processed: get(&self.processed),
            failed: get(&self.failed),
            rate_limited: get(&self.rate_limited),
            malformed: get(&self.malformed),
            reclaimed: get(&self.reclaimed),
            delivered: get(&self.delivered),
            delivery_failed: get(&self.delivery_failed),
            retries_scheduled: get(&self.retries_scheduled),
            retries_dropped: get(&self.retries_dropped),
            healed_requeued: get(&self.healed_requeued),
            healed_permanent: get(&self.healed_permanent),
            loop_errors: get(&self.loop_errors),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    id: String,
    queue: QueueService,
    handler: Arc<dyn MessageHandler>,
    sender: Arc<dyn OutboundSender>,
    cfg: WorkerConfig,
    stats: Arc<WorkerStats>,
    last_heartbeat: Option<Instant>,
}

impl Worker {
    pub fn new(
        id: String,
        queue: QueueService,
        handler: Arc<dyn MessageHandler>,
        sender: Arc<dyn OutboundSender>,
        cfg: WorkerConfig,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            id,
            queue,
            handler,
            sender,
            cfg,
            stats,
            last_heartbeat: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Run ticks until cancelled.  Returns an error once
    /// `max_consecutive_errors` ticks in a row have failed.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(worker = %self.id, "worker started");
        let tick_pause = Duration::from_millis(self.cfg.tick_pause_ms);
        let error_pause = Duration::from_millis(self.cfg.error_pause_ms);
        let mut tick: u64 = 0;
        let mut consecutive_errors: u32 = 0;

        while !cancel.is_cancelled() {
            let pause = match self.tick(tick).await {
                Ok(()) => {
                    consecutive_errors = 0;
                    tick_pause
                }
                Err(e) => {
                    consecutive_errors += 1;
                    bump(&self.stats.loop_errors);
                    warn!(
                        worker = %self.id,
                        consecutive = consecutive_errors,
                        error = %format!("{e:#}"),
                        "worker tick failed"
                    );
                    if consecutive_errors >= self.cfg.max_consecutive_errors {
                        error!(worker = %self.id, "too many consecutive errors, worker stopping");
                        return Err(e.context(format!(
                            "worker {} gave up after {} consecutive errors",
                            self.id, consecutive_errors
                        )));
                    }
                    error_pause
                }
            };
            tick = tick.wrapping_add(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(worker = %self.id, "worker stopped");
        Ok(())
    }

    /// One loop iteration.
    pub async fn tick(&mut self, n: u64) -> anyhow::Result<()> {
        self.heartbeat().await?;

        let (claimed, delivered, promoted) = tokio::join!(
            self.claim_and_process(),
            self.deliver_one(),
            self.queue.promote_due_retries(unix_now(), PROMOTE_PER_TICK),
        );
        claimed?;
        delivered?;
        promoted?;

        if n % self.cfg.reclaim_every_ticks == 0 {
            self.reclaim_stalled().await?;
        }
        if n % self.cfg.heal_every_ticks == 0 {
            let report = self.queue.auto_heal_dead_letters(self.queue.config().heal_batch).await?;
            self.stats
                .healed_requeued
                .fetch_add(report.requeued as u64, Ordering::Relaxed);
            self.stats
                .healed_permanent
                .fetch_add((report.permanent + report.corrupt) as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn heartbeat(&mut self) -> anyhow::Result<()> {
        let interval = Duration::from_secs(self.cfg.heartbeat_interval_secs);
        if self.last_heartbeat.is_some_and(|at| at.elapsed() < interval) {
            return Ok(());
        }
        self.queue
            .store()
            .set(
                &format!("worker:heartbeat:{}", self.id),
                "alive",
                Some(Duration::from_secs(self.cfg.heartbeat_ttl_secs)),
            )
            .await
            .context("write heartbeat")?;
        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    async fn claim_and_process(&self) -> anyhow::Result<usize> {
        let entries = self
            .queue
            .read_inbound(
                &self.id,
                self.cfg.claim_count,
                Duration::from_millis(self.cfg.block_ms),
            )
            .await?;
        let count = entries.len();
        for entry in entries {
            self.process_entry(entry).await?;
        }
        Ok(count)
    }

    async fn reclaim_stalled(&self) -> anyhow::Result<()> {
        let entries = self
            .queue
            .reclaim_stalled(
                &self.id,
                Duration::from_secs(self.cfg.idle_threshold_secs),
                self.cfg.reclaim_batch,
            )
            .await?;
        if !entries.is_empty() {
            info!(worker = %self.id, count = entries.len(), "reclaimed stalled entries");
        }
        for entry in entries {
            bump(&self.stats.reclaimed);
            self.process_entry(entry).await?;
        }
        Ok(())
    }

    /// Handle one claimed entry and finalize it.  Errors mean the store
    /// failed; the entry then stays pending and will be reclaimed.
    async fn process_entry(&self, entry: StreamEntry) -> anyhow::Result<()> {
        let msg = match InboundMessage::from_entry(&entry) {
            Ok(msg) => msg,
            Err(e) => {
                bump(&self.stats.malformed);
                warn!(worker = %self.id, id = %entry.id, error = %e, "malformed inbound entry");
                let parked = DeadLetterEntry {
                    original_payload: entry.fields.iter().cloned().collect(),
                    error: e.to_string(),
                    failed_at: chrono::Utc::now(),
                    retry_count: 0,
                };
                let raw = serde_json::to_string(&parked).context("serialize malformed entry")?;
                self.queue.store_permanent(&raw).await?;
                return self.queue.finalize(&entry.id).await;
            }
        };

        if self.is_rate_limited(&msg.sender).await {
            bump(&self.stats.rate_limited);
            warn!(worker = %self.id, sender = %mask_sender(&msg.sender), "sender rate limited, dropping message");
            return self.queue.finalize(&msg.id).await;
        }

        match self.handler.handle(&msg).await {
            Ok(reply) => {
                bump(&self.stats.processed);
                debug!(worker = %self.id, id = %msg.id, "message processed");
                if let Some(text) = reply {
                    self.queue
                        .enqueue_outbound(&OutboundMessage::new(msg.sender.clone(), text))
                        .await?;
                }
            }
            Err(e) => {
                bump(&self.stats.failed);
                error!(
                    worker = %self.id,
                    id = %msg.id,
                    retry_count = msg.retry_count,
                    error = %format!("{e:#}"),
                    "message processing failed"
                );
                if !self.queue.store_dead_letter(&msg, &format!("{e:#}")).await {
                    anyhow::bail!("dead-letter storage unavailable for entry {}", msg.id);
                }
                if let Some(text) = &self.cfg.failure_reply {
                    let reply = OutboundMessage::new(msg.sender.clone(), text.clone());
                    if let Err(e) = self.queue.enqueue_outbound(&reply).await {
                        warn!(error = %e, "failed to enqueue failure reply");
                    }
                }
            }
        }
        self.queue.finalize(&msg.id).await
    }

    /// Sliding per-sender window.  Store errors fail open.
    async fn is_rate_limited(&self, sender: &str) -> bool {
        let key = format!("rate:{sender}");
        let window = Duration::from_secs(self.cfg.rate_limit_window_secs);
        match self.queue.store().incr_with_expiry(&key, window).await {
            Ok(count) => count > self.cfg.rate_limit_max,
            Err(e) => {
                warn!(error = %e, "rate limit check failed, allowing message");
                false
            }
        }
    }

    /// Deliver at most one outbound message.
    async fn deliver_one(&self) -> anyhow::Result<bool> {
        let popped = self
            .queue
            .pop_outbound(Duration::from_millis(self.cfg.outbound_block_ms))
            .await?;
        match popped {
            None => Ok(false),
            Some(OutboundPop::Corrupt(raw)) => {
                warn!(payload = %truncate_str(&raw, 120), "corrupt outbound payload, parking");
                self.queue.store_permanent(&raw).await?;
                Ok(false)
            }
            Some(OutboundPop::Message(msg)) => match self.sender.send(&msg).await {
                Ok(()) => {
                    bump(&self.stats.delivered);
                    Ok(true)
                }
                Err(e) => {
                    bump(&self.stats.delivery_failed);
                    warn!(
                        correlation_id = %msg.correlation_id,
                        attempts = msg.attempts,
                        error = %e,
                        "outbound delivery failed"
                    );
                    match self.queue.schedule_retry(msg).await? {
                        RetryDecision::Scheduled { .. } => bump(&self.stats.retries_scheduled),
                        RetryDecision::Dropped { .. } => bump(&self.stats.retries_dropped),
                    }
                    Ok(false)
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A set of workers sharing one queue.
pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Start `concurrency` workers.  A worker that fails fatally cancels
    /// `cancel`, bringing the rest of the pool down with it.
    pub fn spawn(
        queue: QueueService,
        handler: Arc<dyn MessageHandler>,
        sender: Arc<dyn OutboundSender>,
        cfg: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let workers = (0..cfg.concurrency.max(1))
            .map(|_| {
                let id = crate::utils::worker_id();
                let worker = Worker::new(
                    id.clone(),
                    queue.clone(),
                    handler.clone(),
                    sender.clone(),
                    cfg.clone(),
                    stats.clone(),
                );
                let cancel = cancel.clone();
                let handle = tokio::spawn(async move {
                    let result = worker.run(cancel.clone()).await;
                    if result.is_err() {
                        cancel.cancel();
                    }
                    result
                });
                (id, handle)
            })
            .collect();
        Self { workers, stats }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Wait up to `timeout` for every worker to stop.  Returns the first
    /// fatal worker error, if any.
    pub async fn join(self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut first_err = None;
        for (id, handle) in self.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    first_err.get_or_insert(e);
                }
                Ok(Err(join_err)) => {
                    error!(worker = %id, error = %join_err, "worker task panicked");
                    first_err.get_or_insert_with(|| anyhow::anyhow!("worker {id} panicked"));
                }
                Err(_) => warn!(worker = %id, "worker did not stop in time"),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::store::{MemoryStore, Store};

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, msg: &InboundMessage) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("echo: {}", msg.text)))
        }
    }

    struct FailingSender;

    #[async_trait]
    impl OutboundSender for FailingSender {
        async fn send(&self, _msg: &OutboundMessage) -> anyhow::Result<()> {
            anyhow::bail!("channel down")
        }
    }

    fn worker(sender: Arc<dyn OutboundSender>) -> (Worker, QueueService) {
        let queue = QueueService::new(Arc::new(MemoryStore::new()), QueueConfig::default());
        let cfg = WorkerConfig {
            block_ms: 10,
            outbound_block_ms: 10,
            rate_limit_max: 2,
            ..Default::default()
        };
        let w = Worker::new(
            "w_test".into(),
            queue.clone(),
            Arc::new(Echo),
            sender,
            cfg,
            Arc::new(WorkerStats::default()),
        );
        (w, queue)
    }

    #[tokio::test]
    async fn tick_processes_and_writes_heartbeat() {
        let (mut w, q) = worker(Arc::new(LogSender));
        q.ensure_group().await.unwrap();
        q.enqueue_inbound("+385900000", "status?", None).await.unwrap();

        w.tick(1).await.unwrap();
        assert_eq!(w.stats.snapshot().processed, 1);
        assert_eq!(q.depths().await.unwrap().inbound, 0);
        assert!(q
            .store()
            .get("worker:heartbeat:w_test")
            .await
            .unwrap()
            .is_some());

        // the reply goes out by the next tick at the latest
        w.tick(2).await.unwrap();
        assert_eq!(w.stats.snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn rate_limited_senders_are_dropped() {
        let (mut w, q) = worker(Arc::new(LogSender));
        q.ensure_group().await.unwrap();
        for _ in 0..3 {
            q.enqueue_inbound("+1555", "hi", None).await.unwrap();
        }
        w.tick(1).await.unwrap();
        let s = w.stats.snapshot();
        assert_eq!(s.processed, 2);
        assert_eq!(s.rate_limited, 1);
        assert_eq!(q.depths().await.unwrap().inbound, 0);
    }

    #[tokio::test]
    async fn malformed_entries_are_parked() {
        let (mut w, q) = worker(Arc::new(LogSender));
        q.ensure_group().await.unwrap();
        q.store()
            .xadd(
                &q.config().inbound_stream,
                &[("text".to_string(), "no sender".to_string())],
            )
            .await
            .unwrap();
        w.tick(1).await.unwrap();
        assert_eq!(w.stats.snapshot().malformed, 1);
        let depths = q.depths().await.unwrap();
        assert_eq!(depths.inbound, 0);
        assert_eq!(depths.permanent, 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_scheduled() {
        let (mut w, q) = worker(Arc::new(FailingSender));
        q.ensure_group().await.unwrap();
        q.enqueue_outbound(&OutboundMessage::new("+1", "hello"))
            .await
            .unwrap();
        w.tick(1).await.unwrap();
        assert_eq!(w.stats.snapshot().retries_scheduled, 1);
        assert_eq!(q.depths().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn corrupt_outbound_is_parked() {
        let (mut w, q) = worker(Arc::new(LogSender));
        q.ensure_group().await.unwrap();
        q.store()
            .rpush(&q.config().outbound_list, "not json")
            .await
            .unwrap();
        w.tick(1).await.unwrap();
        assert_eq!(q.depths().await.unwrap().permanent, 1);
    }
}
