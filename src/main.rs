use claw_relay::cli;
use claw_relay::config;
use claw_relay::gateway::CallContext;
use claw_relay::monitor;
use claw_relay::worker::{self, CapabilityHandler, WorkerPool};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Durable message relay with a capability registry")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (workers, registry refresh, monitor)
    Start,
    /// Append a message to the inbound stream
    Enqueue {
        /// Sender identifier (e.g. a phone number)
        #[arg(long)]
        sender: String,
        /// Message text
        #[arg(long)]
        text: String,
        /// Upstream message id, if any
        #[arg(long)]
        message_id: Option<String>,
    },
    /// Show queue depths, registry snapshot and daemon health
    Status,
    /// Inspect and repair the dead-letter list
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Build, search and call the capability registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
}

#[derive(Subcommand, Debug)]
enum DlqAction {
    /// Re-enqueue dead letters with a fresh retry count
    Replay {
        /// Only list what would be replayed
        #[arg(long)]
        dry_run: bool,
        /// Maximum entries to replay
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Run one auto-heal pass now
    Heal,
}

#[derive(Subcommand, Debug)]
enum RegistryAction {
    /// Run one leader/follower build cycle
    Build,
    /// Rank capabilities against a free-text query
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Invoke a remote operation by id
    Call {
        operation_id: String,
        /// Call parameter as name=value (repeatable)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
        #[arg(long)]
        person_id: Option<String>,
        #[arg(long)]
        tenant_id: Option<String>,
        #[arg(long)]
        vehicle_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| claw_relay::relay_home().join("config.yaml"));

    let cfg = match config::Config::load(&config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = claw_relay::logs::init_tracing(cfg.log.format) {
        eprintln!("error: failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Start) | None => run_daemon(cfg).await,
        Some(Command::Enqueue {
            sender,
            text,
            message_id,
        }) => cli::enqueue(&cfg, &sender, &text, message_id.as_deref()).await,
        Some(Command::Status) => cli::status(&cfg).await,
        Some(Command::Dlq { action }) => match action {
            DlqAction::Replay { dry_run, limit } => cli::dlq_replay(&cfg, dry_run, limit).await,
            DlqAction::Heal => cli::dlq_heal(&cfg).await,
        },
        Some(Command::Registry { action }) => match action {
            RegistryAction::Build => cli::registry_build(&cfg).await,
            RegistryAction::Search { query, top_k } => {
                let top_k = top_k.unwrap_or(cfg.registry.top_k);
                cli::registry_search(&cfg, &query, top_k).await
            }
            RegistryAction::Call {
                operation_id,
                params,
                person_id,
                tenant_id,
                vehicle_id,
            } => {
                let ctx = CallContext {
                    person_id,
                    tenant_id,
                    vehicle_id,
                };
                cli::registry_call(&cfg, &operation_id, &params, ctx).await
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "relay exited with an error");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run workers, registry refresh and the monitor until Ctrl-C or a fatal
/// worker error.
async fn run_daemon(cfg: config::Config) -> anyhow::Result<()> {
    info!(store = %cfg.store.url, workers = cfg.worker.concurrency, "starting relay daemon");

    let store = cli::open_store(&cfg).await?;
    let queue = claw_relay::queue::QueueService::new(store.clone(), cfg.queue.clone());
    queue
        .ensure_group()
        .await
        .context("store unavailable at startup")?;

    let cancel = CancellationToken::new();

    // --- Registry ---
    let registry = cli::build_registry(&cfg, store.clone())?;
    if registry.load_snapshot().await {
        let status = registry.status();
        info!(generation = status.generation, tools = status.tools, "registry ready from snapshot");
    }
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            match registry.build().await {
                Ok(outcome) => info!(?outcome, "startup registry build finished"),
                Err(e) => warn!(error = %e, "startup registry build failed"),
            }
        });
    }
    let _refresh = (cfg.registry.auto_update_secs > 0).then(|| {
        registry.clone().spawn_auto_update(
            Duration::from_secs(cfg.registry.auto_update_secs),
            cancel.clone(),
        )
    });

    // --- Workers ---
    let cache = claw_relay::cache::CacheService::new(store.clone(), "cache");
    let handler = std::sync::Arc::new(CapabilityHandler::new(
        registry.clone(),
        cache,
        cfg.registry.top_k,
        Duration::from_secs(cfg.registry.search_cache_ttl_secs),
    ));
    let sender = worker::sender_from_config(&cfg.outbound)?;
    let pool = WorkerPool::spawn(
        queue.clone(),
        handler,
        sender,
        cfg.worker.clone(),
        cancel.clone(),
    );

    // --- Monitor ---
    let _monitor = match &cfg.monitor {
        Some(m) => {
            let addr = m
                .bind
                .parse()
                .with_context(|| format!("config: invalid monitor.bind '{}'", m.bind))?;
            let state = monitor::MonitorState::new(
                queue.clone(),
                pool.stats(),
                Some(registry.clone()),
                pool.ids(),
            );
            Some(monitor::start_monitor(addr, state).await?)
        }
        None => None,
    };

    info!(workers = ?pool.ids(), "relay ready");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            info!("received Ctrl-C, shutting down");
        }
        _ = cancel.cancelled() => {
            warn!("a worker stopped fatally, shutting down");
        }
    }
    cancel.cancel();

    let drain = Duration::from_secs(cfg.worker.drain_timeout_secs);
    info!(timeout_secs = drain.as_secs(), "waiting for workers to drain");
    pool.join(drain).await?;

    info!("shutdown complete");
    Ok(())
}
