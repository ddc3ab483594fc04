//! Operator subcommands.
//!
//! Every command here talks to the shared store (and, for the registry
//! commands, the remote APIs) directly; none of them needs a running
//! daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::embedding::HttpEmbedder;
use crate::gateway::{CallContext, RemoteGateway};
use crate::queue::QueueService;
use crate::registry::snapshot::SnapshotStore;
use crate::registry::{BuildOutcome, CapabilityRegistry};
use crate::store::Store;
use crate::utils::truncate_str;

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

/// Connect to the configured store.
pub async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    crate::store::connect(&cfg.store.url)
        .await
        .with_context(|| format!("failed to connect to store {}", cfg.store.url))
}

/// Connect to the store and wrap it in a queue service.
///
/// Refuses the in-process store: a fresh `memory://` store never holds
/// the daemon's queues.
pub async fn open_queue(cfg: &Config) -> anyhow::Result<QueueService> {
    if cfg.store.url.starts_with("memory://") {
        anyhow::bail!(
            "queue commands need the daemon's shared store, but store.url is {}; set it to a redis:// URL",
            cfg.store.url
        );
    }
    let store = open_store(cfg).await?;
    Ok(QueueService::new(store, cfg.queue.clone()))
}

/// Build the capability registry.  Needs the `embedding` section.
pub fn build_registry(
    cfg: &Config,
    store: Arc<dyn Store>,
) -> anyhow::Result<Arc<CapabilityRegistry>> {
    let emb_cfg = cfg
        .embedding
        .as_ref()
        .context("config: the embedding section is required for the capability registry")?;
    let embedder = HttpEmbedder::from_config(emb_cfg)?;
    let registry = CapabilityRegistry::new(cfg.registry.clone(), store, Arc::new(embedder))?;
    Ok(Arc::new(registry))
}

/// Parse a `name=value` call parameter.  Values that parse as JSON keep
/// their type; everything else is a string.
pub fn parse_param(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("parameter '{raw}' must look like name=value"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("parameter '{raw}' has an empty name");
    }
    let value = serde_json::from_str::<Value>(value)
        .ok()
        .filter(|v| !v.is_string())
        .unwrap_or_else(|| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Queue commands
// ---------------------------------------------------------------------------

pub async fn enqueue(
    cfg: &Config,
    sender: &str,
    text: &str,
    message_id: Option<&str>,
) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    queue.ensure_group().await?;
    let id = queue.enqueue_inbound(sender, text, message_id).await?;
    println!("enqueued {id}");
    Ok(())
}

/// Print queue depths, registry snapshot state and, when a monitor is
/// configured, the daemon's health.
pub async fn status(cfg: &Config) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    let depths = queue.depths().await?;
    println!("Queue ({})", cfg.store.url);
    println!("  inbound:      {}", depths.inbound);
    println!("  outbound:     {}", depths.outbound);
    println!("  scheduled:    {}", depths.scheduled);
    println!("  dead letters: {}", depths.dead_letter);
    println!("  permanent:    {}", depths.permanent);

    let snapshots = SnapshotStore::new(cfg.registry.snapshot_dir());
    match snapshots.load().await {
        Some(state) => println!(
            "Registry snapshot: generation {}, {} tools, {} embeddings",
            state.generation,
            state.tools.len(),
            state.embeddings.len()
        ),
        None => println!("Registry snapshot: none at {}", snapshots.live_path().display()),
    }

    if let Some(monitor) = &cfg.monitor {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        let url = format!("http://{}/api/health", monitor.bind);
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = resp.json().await.unwrap_or_default();
                println!(
                    "Daemon: running (uptime {}s, {} workers)",
                    body["uptime_secs"], body["workers"]
                );
            }
            Ok(resp) => println!("Daemon: responded with {}", resp.status()),
            Err(_) => println!("Daemon: not reachable at {}", monitor.bind),
        }
    }
    Ok(())
}

pub async fn dlq_replay(cfg: &Config, dry_run: bool, limit: usize) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    let report = queue.replay_dead_letters(dry_run, limit).await?;
    let verb = if dry_run { "would replay" } else { "replayed" };
    println!("{verb} {} dead letter(s)", report.replayed);
    if report.corrupt > 0 {
        println!("{} corrupt entr(ies) moved to permanent storage", report.corrupt);
    }
    for entry in &report.entries {
        println!(
            "  {}  retry={}  {}",
            entry.failed_at.to_rfc3339(),
            entry.retry_count,
            truncate_str(&entry.error, 80)
        );
    }
    Ok(())
}

pub async fn dlq_heal(cfg: &Config) -> anyhow::Result<()> {
    let queue = open_queue(cfg).await?;
    let report = queue.auto_heal_dead_letters(cfg.queue.heal_batch).await?;
    println!(
        "requeued {}, moved to permanent {}, corrupt {}",
        report.requeued, report.permanent, report.corrupt
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry commands
// ---------------------------------------------------------------------------

pub async fn registry_build(cfg: &Config) -> anyhow::Result<()> {
    let store = open_store(cfg).await?;
    let registry = build_registry(cfg, store)?;
    registry.load_snapshot().await;
    match registry.build().await? {
        BuildOutcome::Led { generation, tools } => {
            println!("built generation {generation} with {tools} tools")
        }
        BuildOutcome::Followed { generation, tools } => {
            println!("another process built generation {generation} with {tools} tools")
        }
        BuildOutcome::Degraded => {
            println!("registry degraded: no snapshot available and no leader finished")
        }
    }
    Ok(())
}

pub async fn registry_search(cfg: &Config, query: &str, top_k: usize) -> anyhow::Result<()> {
    let store = open_store(cfg).await?;
    let registry = build_registry(cfg, store)?;
    if !registry.load_snapshot().await {
        anyhow::bail!("no registry snapshot found; run `relay registry build` first");
    }
    let hits = registry.find_relevant(query, top_k).await;
    if hits.is_empty() {
        println!("no capability scored above the similarity threshold");
    }
    for hit in hits {
        let d = &hit.descriptor;
        println!(
            "{:.3}  {:<40} {} {}",
            hit.score, d.operation_id, d.method, d.path
        );
    }
    Ok(())
}

pub async fn registry_call(
    cfg: &Config,
    operation_id: &str,
    raw_params: &[String],
    ctx: CallContext,
) -> anyhow::Result<()> {
    let gw_cfg = cfg
        .gateway
        .as_ref()
        .context("config: the gateway section is required for remote calls")?;
    let store = open_store(cfg).await?;
    let registry = build_registry(cfg, store.clone())?;
    if !registry.load_snapshot().await {
        anyhow::bail!("no registry snapshot found; run `relay registry build` first");
    }
    let descriptor = registry
        .get(operation_id)
        .with_context(|| format!("unknown operation '{operation_id}'"))?;

    let mut params = Map::new();
    for raw in raw_params {
        let (name, value) = parse_param(raw)?;
        params.insert(name, value);
    }

    let gateway = RemoteGateway::new(gw_cfg, store)?;
    let outcome = gateway.execute(&descriptor, &params, &ctx).await;
    print_json(&outcome)?;
    if !outcome.is_success() {
        anyhow::bail!("call to {operation_id} did not succeed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_keep_json_types() {
        assert_eq!(parse_param("limit=10").unwrap(), ("limit".into(), Value::from(10)));
        assert_eq!(parse_param("active=true").unwrap(), ("active".into(), Value::Bool(true)));
        assert_eq!(
            parse_param("plate=ZG-1234").unwrap(),
            ("plate".into(), Value::String("ZG-1234".into()))
        );
        // quoted JSON strings are taken literally
        assert_eq!(
            parse_param("name=\"x\"").unwrap(),
            ("name".into(), Value::String("\"x\"".into()))
        );
        assert_eq!(parse_param("q=a=b").unwrap().1, Value::String("a=b".into()));
    }

    #[test]
    fn params_need_a_name() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=5").is_err());
    }

    #[tokio::test]
    async fn queue_commands_refuse_in_process_store() {
        let cfg = Config::default();
        let err = open_queue(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("redis://"));
        assert!(dlq_replay(&cfg, true, 10).await.is_err());
    }

    #[tokio::test]
    async fn registry_commands_need_embedding_config() {
        let cfg = Config::default();
        let store = open_store(&cfg).await.unwrap();
        assert!(build_registry(&cfg, store).is_err());
    }
}
