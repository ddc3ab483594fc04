//! Durable work queue.
//!
//! Four structures live in the store:
//! - the inbound stream, consumed through a consumer group
//! - the outbound list of replies waiting for delivery
//! - the scheduled-retry sorted set (score = execute-at UNIX seconds)
//! - the dead-letter list plus a permanent list with a retention TTL
//!
//! [`QueueService`] owns the key names and the retry / dead-letter policy.
//! It never blocks on processing; workers drive it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::store::{Store, StreamEntry};
use crate::utils::{mask_sender, truncate_str, unix_now};

const FIELD_SENDER: &str = "sender";
const FIELD_TEXT: &str = "text";
const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";
const FIELD_RETRY_COUNT: &str = "retry_count";

/// Longest error text kept in a dead-letter envelope.
const MAX_ERROR_LEN: usize = 500;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A message read from the inbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stream entry id.
    pub id: String,
    pub sender: String,
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub enqueued_at: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Why a stream entry could not be turned into an [`InboundMessage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEntry {
    #[error("entry {0} has no sender")]
    MissingSender(String),
    #[error("entry {0} has no text")]
    MissingText(String),
}

impl InboundMessage {
    /// Build from a stream entry.  A missing or blank sender or text is
    /// malformed; an unparsable retry count reads as 0.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, MalformedEntry> {
        let sender = entry
            .field(FIELD_SENDER)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MalformedEntry::MissingSender(entry.id.clone()))?;
        let text = entry
            .field(FIELD_TEXT)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MalformedEntry::MissingText(entry.id.clone()))?;
        Ok(Self {
            id: entry.id.clone(),
            sender: sender.to_string(),
            text: text.to_string(),
            message_id: entry.field(FIELD_MESSAGE_ID).map(str::to_string),
            enqueued_at: entry.field(FIELD_ENQUEUED_AT).map(str::to_string),
            retry_count: entry
                .field(FIELD_RETRY_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }

    /// Stream fields for this message (the entry id is not a field).
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_SENDER.to_string(), self.sender.clone()),
            (FIELD_TEXT.to_string(), self.text.clone()),
        ];
        if let Some(mid) = &self.message_id {
            fields.push((FIELD_MESSAGE_ID.to_string(), mid.clone()));
        }
        if let Some(at) = &self.enqueued_at {
            fields.push((FIELD_ENQUEUED_AT.to_string(), at.clone()));
        }
        fields.push((FIELD_RETRY_COUNT.to_string(), self.retry_count.to_string()));
        fields
    }
}

/// A reply waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub text: String,
    #[serde(default = "new_correlation_id")]
    pub correlation_id: String,
    #[serde(default)]
    pub attempts: u32,
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
            correlation_id: new_correlation_id(),
            attempts: 0,
        }
    }
}

/// Envelope stored on the dead-letter lists.
///
/// `retry_count` lives here, next to the payload, so the payload itself is
/// the untouched stream field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_payload: BTreeMap<String, String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl DeadLetterEntry {
    /// Stream fields to re-enqueue with the given retry count.
    fn requeue_fields(&self, retry_count: u32) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .original_payload
            .iter()
            .filter(|(k, _)| k.as_str() != FIELD_RETRY_COUNT)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push((FIELD_RETRY_COUNT.to_string(), retry_count.to_string()));
        fields
    }
}

/// Outcome of [`QueueService::schedule_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    Dropped { attempts: u32 },
}

/// Result of one item popped off the outbound list.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPop {
    Message(OutboundMessage),
    /// Raw payload that did not parse.
    Corrupt(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub requeued: usize,
    pub permanent: usize,
    pub corrupt: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub dry_run: bool,
    pub replayed: usize,
    pub corrupt: usize,
    /// Entries that were (or would be) replayed.
    pub entries: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub inbound: usize,
    pub outbound: usize,
    pub scheduled: usize,
    pub dead_letter: usize,
    pub permanent: usize,
}

// ---------------------------------------------------------------------------
// QueueService
// ---------------------------------------------------------------------------

/// Work queue over a shared [`Store`].
#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn Store>,
    cfg: QueueConfig,
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl QueueService {
    pub fn new(store: Arc<dyn Store>, cfg: QueueConfig) -> Self {
        Self { store, cfg }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create the consumer group (idempotent).
    pub async fn ensure_group(&self) -> anyhow::Result<()> {
        self.store
            .create_group(&self.cfg.inbound_stream, &self.cfg.consumer_group)
            .await
            .with_context(|| format!("create consumer group on {}", self.cfg.inbound_stream))
    }

    // -- inbound -------------------------------------------------------------

    /// Append an inbound message and return its entry id.
    pub async fn enqueue_inbound(
        &self,
        sender: &str,
        text: &str,
        message_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let msg = InboundMessage {
            id: String::new(),
            sender: sender.to_string(),
            text: text.to_string(),
            message_id: message_id.map(str::to_string),
            enqueued_at: Some(Utc::now().to_rfc3339()),
            retry_count: 0,
        };
        let id = self
            .store
            .xadd(&self.cfg.inbound_stream, &msg.to_fields())
            .await
            .context("enqueue inbound message")?;
        debug!(id = %id, sender = %mask_sender(sender), "inbound message enqueued");
        Ok(id)
    }

    /// Claim up to `count` never-delivered entries for `consumer`.
    pub async fn read_inbound(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        self.store
            .xread_group(
                &self.cfg.inbound_stream,
                &self.cfg.consumer_group,
                consumer,
                count,
                block,
            )
            .await
            .context("read inbound stream")
    }

    /// Take over entries another consumer left unacknowledged for `min_idle`.
    pub async fn reclaim_stalled(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        self.store
            .xautoclaim(
                &self.cfg.inbound_stream,
                &self.cfg.consumer_group,
                consumer,
                min_idle,
                count,
            )
            .await
            .context("reclaim stalled entries")
    }

    /// Acknowledge and delete an inbound entry.
    pub async fn finalize(&self, entry_id: &str) -> anyhow::Result<()> {
        self.store
            .xack(&self.cfg.inbound_stream, &self.cfg.consumer_group, entry_id)
            .await
            .with_context(|| format!("ack entry {entry_id}"))?;
        self.store
            .xdel(&self.cfg.inbound_stream, entry_id)
            .await
            .with_context(|| format!("delete entry {entry_id}"))?;
        Ok(())
    }

    // -- outbound ------------------------------------------------------------

    pub async fn enqueue_outbound(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        let raw = serde_json::to_string(msg).context("serialize outbound message")?;
        self.store
            .rpush(&self.cfg.outbound_list, &raw)
            .await
            .context("enqueue outbound message")?;
        Ok(())
    }

    /// Pop one outbound message, waiting at most `block`.
    pub async fn pop_outbound(&self, block: Duration) -> anyhow::Result<Option<OutboundPop>> {
        let raw = self
            .store
            .blpop(&self.cfg.outbound_list, block)
            .await
            .context("pop outbound message")?;
        Ok(raw.map(|raw| match serde_json::from_str::<OutboundMessage>(&raw) {
            Ok(msg) => OutboundPop::Message(msg),
            Err(_) => OutboundPop::Corrupt(raw),
        }))
    }

    /// Record a failed delivery attempt and schedule the next one with
    /// exponential backoff, or drop the message once attempts run out.
    pub async fn schedule_retry(&self, mut msg: OutboundMessage) -> anyhow::Result<RetryDecision> {
        msg.attempts += 1;
        if msg.attempts >= self.cfg.max_outbound_attempts {
            error!(
                to = %mask_sender(&msg.to),
                correlation_id = %msg.correlation_id,
                attempts = msg.attempts,
                "outbound delivery failed permanently, dropping"
            );
            return Ok(RetryDecision::Dropped {
                attempts: msg.attempts,
            });
        }

        let delay = Duration::from_secs(2u64.saturating_pow(msg.attempts));
        let raw = serde_json::to_string(&msg).context("serialize retry")?;
        self.store
            .zadd(&self.cfg.schedule_set, &raw, unix_now() + delay.as_secs_f64())
            .await
            .context("schedule retry")?;
        info!(
            correlation_id = %msg.correlation_id,
            attempt = msg.attempts,
            delay_secs = delay.as_secs(),
            "outbound delivery rescheduled"
        );
        Ok(RetryDecision::Scheduled {
            attempt: msg.attempts,
            delay,
        })
    }

    /// Move due scheduled retries back onto the outbound list.
    ///
    /// Only the caller whose remove succeeds re-enqueues a member, so
    /// concurrent promoters never duplicate a retry.
    pub async fn promote_due_retries(&self, now: f64, limit: usize) -> anyhow::Result<usize> {
        let due = self
            .store
            .zrange_by_score(&self.cfg.schedule_set, now, limit)
            .await
            .context("read due retries")?;

        let mut promoted = 0;
        for member in due {
            if !self
                .store
                .zrem(&self.cfg.schedule_set, &member)
                .await
                .context("claim due retry")?
            {
                continue;
            }
            match serde_json::from_str::<OutboundMessage>(&member) {
                Ok(msg) => {
                    if let Err(e) = self.enqueue_outbound(&msg).await {
                        // Put it back as due so the next promoter retries it.
                        error!(error = %e, correlation_id = %msg.correlation_id, "promotion failed, rescheduling retry");
                        if let Err(zadd_err) = self.store.zadd(&self.cfg.schedule_set, &member, now).await {
                            error!(error = %zadd_err, correlation_id = %msg.correlation_id, "failed to reschedule retry");
                        }
                        return Err(e);
                    }
                    promoted += 1;
                }
                Err(e) => {
                    warn!(error = %e, member = %truncate_str(&member, 120), "dropping unparsable scheduled retry");
                }
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted due retries");
        }
        Ok(promoted)
    }

    // -- dead letters --------------------------------------------------------

    /// Park a failed inbound message on the dead-letter list.
    ///
    /// Never fails: store errors are logged and reported as `false`.
    pub async fn store_dead_letter(&self, msg: &InboundMessage, error_text: &str) -> bool {
        let entry = DeadLetterEntry {
            original_payload: msg.to_fields().into_iter().collect(),
            error: truncate_str(error_text, MAX_ERROR_LEN),
            failed_at: Utc::now(),
            retry_count: msg.retry_count,
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, id = %msg.id, "failed to serialize dead letter");
                return false;
            }
        };
        match self.store.rpush(&self.cfg.dead_letter_list, &raw).await {
            Ok(_) => {
                warn!(
                    id = %msg.id,
                    sender = %mask_sender(&msg.sender),
                    retry_count = msg.retry_count,
                    "message moved to dead-letter storage"
                );
                true
            }
            Err(e) => {
                error!(error = %e, id = %msg.id, "failed to store dead letter");
                false
            }
        }
    }

    /// Append a raw payload to permanent storage and refresh its retention.
    ///
    /// The append is the commit point.  A failed TTL refresh is only
    /// logged; the next append refreshes it again.
    pub async fn store_permanent(&self, raw: &str) -> anyhow::Result<()> {
        self.store
            .rpush(&self.cfg.permanent_list, raw)
            .await
            .context("store permanent dead letter")?;
        if let Err(e) = self
            .store
            .expire(&self.cfg.permanent_list, self.cfg.permanent_ttl())
            .await
        {
            warn!(error = %e, "failed to refresh permanent dead-letter ttl");
        }
        Ok(())
    }

    /// Re-queue dead letters that still have retries left; park the rest.
    pub async fn auto_heal_dead_letters(&self, batch: usize) -> anyhow::Result<HealReport> {
        let mut report = HealReport::default();
        for _ in 0..batch {
            let Some(raw) = self
                .store
                .lpop(&self.cfg.dead_letter_list)
                .await
                .context("pop dead letter")?
            else {
                break;
            };

            if let Err(e) = self.heal_one(&raw, &mut report).await {
                // Put it back so nothing popped is lost.
                if let Err(push_err) = self.store.rpush(&self.cfg.dead_letter_list, &raw).await {
                    error!(error = %push_err, "failed to return dead letter after heal error");
                }
                return Err(e);
            }
        }
        if report != HealReport::default() {
            info!(
                requeued = report.requeued,
                permanent = report.permanent,
                corrupt = report.corrupt,
                "dead-letter auto-heal pass"
            );
        }
        Ok(report)
    }

    async fn heal_one(&self, raw: &str, report: &mut HealReport) -> anyhow::Result<()> {
        let entry = match serde_json::from_str::<DeadLetterEntry>(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "corrupt dead letter, moving to permanent storage");
                self.store_permanent(raw).await?;
                report.corrupt += 1;
                return Ok(());
            }
        };

        if entry.retry_count < self.cfg.max_heal_retries {
            let next = entry.retry_count + 1;
            self.store
                .xadd(&self.cfg.inbound_stream, &entry.requeue_fields(next))
                .await
                .context("re-queue dead letter")?;
            report.requeued += 1;
        } else {
            self.store_permanent(raw).await?;
            report.permanent += 1;
        }
        Ok(())
    }

    /// Operator replay of the dead-letter list.
    ///
    /// A dry run only previews.  A real run re-enqueues each original
    /// payload with a fresh retry count; corrupt entries go to permanent
    /// storage.
    pub async fn replay_dead_letters(
        &self,
        dry_run: bool,
        limit: usize,
    ) -> anyhow::Result<ReplayReport> {
        let mut report = ReplayReport {
            dry_run,
            ..Default::default()
        };
        if limit == 0 {
            return Ok(report);
        }

        if dry_run {
            let raws = self
                .store
                .lrange(
                    &self.cfg.dead_letter_list,
                    0,
                    isize::try_from(limit).unwrap_or(isize::MAX) - 1,
                )
                .await
                .context("preview dead letters")?;
            for raw in raws {
                match serde_json::from_str::<DeadLetterEntry>(&raw) {
                    Ok(entry) => report.entries.push(entry),
                    Err(_) => report.corrupt += 1,
                }
            }
            return Ok(report);
        }

        for _ in 0..limit {
            let Some(raw) = self
                .store
                .lpop(&self.cfg.dead_letter_list)
                .await
                .context("pop dead letter")?
            else {
                break;
            };
            match serde_json::from_str::<DeadLetterEntry>(&raw) {
                Ok(entry) => {
                    if let Err(e) = self
                        .store
                        .xadd(&self.cfg.inbound_stream, &entry.requeue_fields(0))
                        .await
                    {
                        if let Err(push_err) =
                            self.store.rpush(&self.cfg.dead_letter_list, &raw).await
                        {
                            error!(error = %push_err, "failed to return dead letter after replay error");
                        }
                        return Err(e).context("replay dead letter");
                    }
                    report.replayed += 1;
                    report.entries.push(entry);
                }
                Err(_) => {
                    self.store_permanent(&raw).await?;
                    report.corrupt += 1;
                }
            }
        }
        info!(
            replayed = report.replayed,
            corrupt = report.corrupt,
            "dead-letter replay finished"
        );
        Ok(report)
    }

    // -- introspection -------------------------------------------------------

    pub async fn depths(&self) -> anyhow::Result<QueueDepths> {
        Ok(QueueDepths {
            inbound: self.store.xlen(&self.cfg.inbound_stream).await?,
            outbound: self.store.llen(&self.cfg.outbound_list).await?,
            scheduled: self.store.zcard(&self.cfg.schedule_set).await?,
            dead_letter: self.store.llen(&self.cfg.dead_letter_list).await?,
            permanent: self.store.llen(&self.cfg.permanent_list).await?,
        })
    }

    /// Parsed view of the dead-letter list (oldest first).
    pub async fn dead_letters(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        self.parsed_list(&self.cfg.dead_letter_list).await
    }

    /// Parsed view of permanent storage; corrupt raw entries are skipped.
    pub async fn permanent_letters(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        self.parsed_list(&self.cfg.permanent_list).await
    }

    async fn parsed_list(&self, key: &str) -> anyhow::Result<Vec<DeadLetterEntry>> {
        let raws = self.store.lrange(key, 0, -1).await?;
        Ok(raws
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }
}
