//! Capability registry.
//!
//! Ingests remote API descriptions, embeds each operation's text and
//! answers "which operations fit this message" by cosine similarity.
//!
//! Building is coordinated across processes: whoever wins the leadership
//! lock fetches, embeds and persists a snapshot; everybody else loads
//! that snapshot.  Searches always read the last fully installed index,
//! which is swapped in atomically, so they are safe during a build.

pub mod descriptor;
pub mod leader;
pub mod openapi;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RegistryConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::store::{Store, StoreError};

use self::descriptor::{CapabilityDescriptor, DenyList};
use self::leader::LeaderLock;
use self::snapshot::{RegistryState, SnapshotError, SnapshotStore};

/// Pause between fetch attempts of one source.
const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("duplicate operation id '{0}'")]
    DuplicateOperation(String),
    #[error("no capabilities available from any source")]
    Empty,
    #[error("no embeddings could be generated; keeping the previous index")]
    NoEmbeddings,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Observable build-cycle outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    BuildCompleted {
        generation: u64,
        tools: usize,
        embedded: usize,
        reused: usize,
    },
    FollowerLoaded {
        generation: u64,
        tools: usize,
    },
    /// The follower gave up waiting for a leader's snapshot.
    Degraded {
        reason: String,
    },
    BuildFailed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Led { generation: u64, tools: usize },
    Followed { generation: u64, tools: usize },
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub ready: bool,
    pub degraded: bool,
    pub tools: usize,
    pub embeddings: usize,
    pub generation: u64,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredCapability {
    pub descriptor: Arc<CapabilityDescriptor>,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryIndex {
    generation: u64,
    tools: Vec<Arc<CapabilityDescriptor>>,
    by_id: HashMap<String, usize>,
    embeddings: HashMap<String, Vec<f32>>,
}

impl RegistryIndex {
    fn from_state(state: RegistryState) -> Self {
        let by_id = state
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.operation_id.clone(), i))
            .collect();
        Self {
            generation: state.generation,
            tools: state.tools.into_iter().map(Arc::new).collect(),
            by_id,
            embeddings: state.embeddings.into_iter().collect(),
        }
    }

    fn to_state(&self) -> RegistryState {
        RegistryState {
            generation: self.generation,
            tools: self.tools.iter().map(|t| (**t).clone()).collect(),
            embeddings: self
                .embeddings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

pub struct CapabilityRegistry {
    cfg: RegistryConfig,
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    http: Client,
    snapshots: SnapshotStore,
    deny: DenyList,
    index: RwLock<Arc<RegistryIndex>>,
    degraded: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
}

impl CapabilityRegistry {
    pub fn new(
        cfg: RegistryConfig,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let (events, _) = broadcast::channel(32);
        Ok(Self {
            snapshots: SnapshotStore::new(cfg.snapshot_dir()),
            deny: DenyList::from_config(&cfg.deny),
            cfg,
            store,
            embedder,
            http,
            index: RwLock::new(Arc::new(RegistryIndex::default())),
            degraded: AtomicBool::new(false),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn current(&self) -> Arc<RegistryIndex> {
        match self.index.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the searchable index.
    pub fn install(&self, state: RegistryState) {
        let next = Arc::new(RegistryIndex::from_state(state));
        match self.index.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Install the on-disk snapshot, if a valid one exists.
    pub async fn load_snapshot(&self) -> bool {
        match self.snapshots.load().await {
            Some(state) if !state.tools.is_empty() => {
                self.install(state);
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> RegistryStatus {
        let idx = self.current();
        RegistryStatus {
            ready: !idx.embeddings.is_empty(),
            degraded: self.degraded.load(Ordering::Relaxed),
            tools: idx.tools.len(),
            embeddings: idx.embeddings.len(),
            generation: idx.generation,
        }
    }

    pub fn len(&self) -> usize {
        self.current().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<CapabilityDescriptor>> {
        let idx = self.current();
        idx.by_id.get(operation_id).map(|&i| idx.tools[i].clone())
    }

    // -- build cycle ---------------------------------------------------------

    /// Run one leader/follower build cycle.
    pub async fn build(&self) -> Result<BuildOutcome, BuildError> {
        let lock = LeaderLock::new(
            self.store.clone(),
            &self.cfg.lock_key,
            Duration::from_secs(self.cfg.lock_ttl_secs),
        );

        if !lock.try_acquire().await? {
            return self.follow(&lock).await;
        }

        let result = self.lead().await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release leadership lock; it will expire");
        }

        match result {
            Ok((generation, tools, embedded, reused)) => {
                self.degraded.store(false, Ordering::Relaxed);
                self.publish(RegistryEvent::BuildCompleted {
                    generation,
                    tools,
                    embedded,
                    reused,
                });
                Ok(BuildOutcome::Led { generation, tools })
            }
            Err(e) => {
                error!(error = %e, "registry build failed");
                self.publish(RegistryEvent::BuildFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Leader path.  Returns (generation, tools, newly embedded, reused).
    async fn lead(&self) -> Result<(u64, usize, usize, usize), BuildError> {
        let previous = match self.snapshots.load().await {
            Some(state) => state,
            None => self.current().to_state(),
        };
        let generation = previous.generation + 1;
        info!(generation, sources = self.cfg.sources.len(), "leading registry build");

        // Fetch and parse every source.
        let mut tools: Vec<CapabilityDescriptor> = Vec::new();
        for source in &self.cfg.sources {
            match openapi::fetch_document(
                &self.http,
                &source.url,
                self.cfg.fetch_attempts,
                FETCH_RETRY_PAUSE,
            )
            .await
            {
                Ok(doc) => {
                    let parsed = openapi::parse_document(&source.service, &doc, &self.deny);
                    info!(service = %source.service, tools = parsed.len(), "source parsed");
                    tools.extend(parsed);
                }
                Err(e) => {
                    let kept: Vec<CapabilityDescriptor> = previous
                        .tools
                        .iter()
                        .filter(|t| t.service == source.service)
                        .cloned()
                        .collect();
                    warn!(
                        service = %source.service,
                        kept = kept.len(),
                        error = %e,
                        "source unavailable, keeping previous capabilities"
                    );
                    tools.extend(kept);
                }
            }
        }

        let mut seen = HashSet::new();
        for t in &tools {
            if !seen.insert(t.operation_id.as_str()) {
                return Err(BuildError::DuplicateOperation(t.operation_id.clone()));
            }
        }
        if tools.is_empty() {
            return Err(BuildError::Empty);
        }

        // Reuse vectors of unchanged descriptors.
        let previous_hashes: HashMap<&str, &str> = previous
            .tools
            .iter()
            .map(|t| (t.operation_id.as_str(), t.content_hash.as_str()))
            .collect();
        let mut embeddings: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        let mut missing: Vec<usize> = Vec::new();
        for (i, t) in tools.iter().enumerate() {
            let unchanged = previous_hashes.get(t.operation_id.as_str()) == Some(&t.content_hash.as_str());
            match previous.embeddings.get(&t.operation_id) {
                Some(v) if unchanged => {
                    embeddings.insert(t.operation_id.clone(), v.clone());
                }
                _ => missing.push(i),
            }
        }
        let reused = embeddings.len();

        let mut state = RegistryState {
            generation,
            tools,
            embeddings,
        };
        let embedded = self.embed_missing(&mut state, &missing).await?;

        if !self.snapshots.persist(&state).await? {
            return Err(BuildError::NoEmbeddings);
        }
        let tool_count = state.tools.len();
        self.install(state);
        info!(generation, tools = tool_count, embedded, reused, "registry build complete");
        Ok((generation, tool_count, embedded, reused))
    }

    /// Embed the descriptors at `missing` in paced batches, checkpointing
    /// the snapshot as vectors accumulate.  Failed batches are skipped.
    async fn embed_missing(
        &self,
        state: &mut RegistryState,
        missing: &[usize],
    ) -> Result<usize, BuildError> {
        if missing.is_empty() {
            info!(total = state.embeddings.len(), "all embeddings reused");
            return Ok(0);
        }
        info!(count = missing.len(), "generating embeddings");

        let pause = Duration::from_millis(self.cfg.embedding_pause_ms);
        let mut generated = 0usize;
        let mut since_checkpoint = 0usize;
        let mut failures = 0usize;

        for (n, batch) in missing.chunks(self.cfg.embedding_batch_size).enumerate() {
            if n > 0 {
                tokio::time::sleep(pause).await;
            }
            let texts: Vec<String> = batch
                .iter()
                .map(|&i| state.tools[i].embedding_text.clone())
                .collect();
            match self.embedder.embed(&texts).await {
                Ok(vectors) => {
                    for (&i, v) in batch.iter().zip(vectors) {
                        if v.is_empty() {
                            failures += 1;
                            continue;
                        }
                        state.embeddings.insert(state.tools[i].operation_id.clone(), v);
                        generated += 1;
                        since_checkpoint += 1;
                    }
                }
                Err(e) => {
                    failures += batch.len();
                    warn!(batch = n, error = %e, "embedding batch failed");
                }
            }

            if since_checkpoint >= self.cfg.checkpoint_every {
                self.snapshots.persist(state).await?;
                debug!(generated, "embedding checkpoint saved");
                since_checkpoint = 0;
            }
        }

        info!(generated, failures, total = state.embeddings.len(), "embeddings generated");
        Ok(generated)
    }

    /// Follower path.
    async fn follow(&self, lock: &LeaderLock) -> Result<BuildOutcome, BuildError> {
        if let Some(outcome) = self.follower_load().await {
            return Ok(outcome);
        }

        info!("waiting for registry leader");
        let released = lock
            .wait_for_release(
                self.cfg.follower_poll_attempts,
                Duration::from_secs(self.cfg.follower_poll_interval_secs),
            )
            .await?;
        if released {
            if let Some(outcome) = self.follower_load().await {
                return Ok(outcome);
            }
        }

        let reason = if released {
            "leader finished without a usable snapshot".to_string()
        } else {
            "timed out waiting for registry leader".to_string()
        };
        warn!(reason = %reason, tools = self.len(), "registry running degraded");
        self.degraded.store(true, Ordering::Relaxed);
        self.publish(RegistryEvent::Degraded { reason });
        Ok(BuildOutcome::Degraded)
    }

    async fn follower_load(&self) -> Option<BuildOutcome> {
        if !self.load_snapshot().await {
            return None;
        }
        let status = self.status();
        info!(tools = status.tools, generation = status.generation, "registry loaded from snapshot");
        self.degraded.store(false, Ordering::Relaxed);
        self.publish(RegistryEvent::FollowerLoaded {
            generation: status.generation,
            tools: status.tools,
        });
        Some(BuildOutcome::Followed {
            generation: status.generation,
            tools: status.tools,
        })
    }

    /// Re-run the build cycle every `interval` until cancelled.
    pub fn spawn_auto_update(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The startup build already ran.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        debug!("registry refresh starting");
                        if let Err(e) = self.build().await {
                            warn!(error = %e, "registry refresh failed");
                        }
                    }
                }
            }
            debug!("registry auto-update stopped");
        })
    }

    // -- search --------------------------------------------------------------

    /// Embed `query` and return the best matching capabilities.
    ///
    /// Embedding failures degrade to an empty result.
    pub async fn find_relevant(&self, query: &str, top_k: usize) -> Vec<ScoredCapability> {
        if self.current().embeddings.is_empty() {
            warn!("registry not ready, no capabilities to search");
            return Vec::new();
        }
        match self.embedder.embed_one(query).await {
            Ok(vector) => self.rank(&vector, top_k),
            Err(e) => {
                error!(error = %e, "failed to embed search query");
                Vec::new()
            }
        }
    }

    /// Score every embedded, allowed descriptor against `query_vector`.
    /// Ties keep index order.
    pub fn rank(&self, query_vector: &[f32], top_k: usize) -> Vec<ScoredCapability> {
        let idx = self.current();
        let mut scored: Vec<ScoredCapability> = idx
            .tools
            .iter()
            .filter(|t| !self.deny.is_denied(&t.operation_id, &t.path))
            .filter_map(|t| {
                let v = idx.embeddings.get(&t.operation_id)?;
                let score = cosine_similarity(query_vector, v);
                (score >= self.cfg.similarity_threshold).then(|| ScoredCapability {
                    descriptor: t.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        if let Some(best) = scored.first() {
            debug!(
                best = %best.descriptor.operation_id,
                score = best.score,
                hits = scored.len(),
                "capability search"
            );
        }
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::HttpMethod;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct NoEmbedder;

    #[async_trait]
    impl Embedder for NoEmbedder {
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("offline")
        }
    }

    fn tool(id: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            operation_id: id.into(),
            service: "svc".into(),
            method: HttpMethod::Get,
            path: format!("/svc/{id}"),
            description: id.into(),
            params: vec![],
            required_params: vec![],
            auto_inject: vec![],
            embedding_text: id.into(),
            call_schema: serde_json::json!({}),
            content_hash: String::new(),
        }
        .sealed()
    }

    fn registry(dir: &std::path::Path) -> CapabilityRegistry {
        let cfg = RegistryConfig {
            snapshot_dir: Some(dir.display().to_string()),
            ..Default::default()
        };
        CapabilityRegistry::new(cfg, Arc::new(MemoryStore::new()), Arc::new(NoEmbedder)).unwrap()
    }

    fn install(reg: &CapabilityRegistry, entries: &[(&str, Vec<f32>)]) {
        reg.install(RegistryState {
            generation: 1,
            tools: entries.iter().map(|(id, _)| tool(id)).collect(),
            embeddings: entries
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect(),
        });
    }

    #[test]
    fn rank_orders_by_similarity_and_applies_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        install(
            &reg,
            &[
                ("get_second", vec![0.0, 1.0]),
                ("get_first", vec![1.0, 0.0]),
                ("get_far", vec![-1.0, 0.0]),
            ],
        );
        let hits = reg.rank(&[0.9, 0.1], 5);
        let ids: Vec<&str> = hits.iter().map(|h| h.descriptor.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["get_first"]);

        let hits = reg.rank(&[0.7, 0.7], 5);
        let ids: Vec<&str> = hits.iter().map(|h| h.descriptor.operation_id.as_str()).collect();
        // equal scores keep index order
        assert_eq!(ids, vec!["get_second", "get_first"]);
    }

    #[test]
    fn rank_skips_denied_and_unembedded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.install(RegistryState {
            generation: 1,
            tools: vec![tool("get_export"), tool("get_plain"), tool("get_novec")],
            embeddings: [
                ("get_export".to_string(), vec![1.0, 0.0]),
                ("get_plain".to_string(), vec![1.0, 0.0]),
            ]
            .into_iter()
            .collect(),
        });
        let hits = reg.rank(&[1.0, 0.0], 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].descriptor.operation_id, "get_plain");
        assert!(reg.get("get_novec").is_some());
    }

    #[tokio::test]
    async fn find_relevant_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.find_relevant("anything", 5).await.is_empty());
        install(&reg, &[("get_a", vec![1.0])]);
        assert!(reg.find_relevant("anything", 5).await.is_empty());
        assert!(reg.status().ready);
    }

    #[tokio::test]
    async fn build_without_sources_fails_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut events = reg.subscribe_events();
        assert!(matches!(reg.build().await, Err(BuildError::Empty)));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::BuildFailed { .. }
        ));
        assert_eq!(reg.store.get(&reg.cfg.lock_key).await.unwrap(), None);
    }
}
