use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::anomaly::engine::WindowAnalyzer;
use crate::config::{parse_address, Config};
use crate::db::{PgStore, Store};
use crate::enforcement::{ContractSubmitter, EnforcementEngine};
use crate::indexer::chain::ConfirmedWatcher;
use crate::indexer::mempool::PendingWatcher;
use crate::pipeline::TransferPipeline;
use crate::rules::registry::seed_rules;
use crate::watchlist::loader::{load_watchlist, load_whitelist};

/// How shutdown ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean,
    /// Names of tasks still running when the grace period ran out.
    TimedOut(Vec<String>),
}

type RunningSet = Arc<Mutex<BTreeSet<String>>>;

/// Removes a task from the running set when its future completes or unwinds.
struct RunningGuard {
    name: String,
    running: RunningSet,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.name);
    }
}

/// Owns the process-wide cancellable lifetime and every long-running task.
pub struct Orchestrator {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: RunningSet,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a named task. It must return once the shutdown token is cancelled.
    pub fn spawn<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());

        let guard = RunningGuard {
            name: name.to_string(),
            running: self.running.clone(),
        };
        self.tracker.spawn(async move {
            task.await;
            tracing::debug!(task = %guard.name, "Task finished");
        });
        tracing::info!(task = %name, "Task started");
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Cancel every task and wait up to `grace` for them to return.
    pub async fn shutdown(self, grace: Duration) -> ShutdownOutcome {
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => ShutdownOutcome::Clean,
            Err(_) => {
                let stuck = self.running_tasks();
                for task in &stuck {
                    tracing::error!(task = %task, grace_secs = grace.as_secs(), "Task still running after grace period");
                }
                ShutdownOutcome::TimedOut(stuck)
            }
        }
    }
}

/// Resolve on SIGINT, or SIGTERM on unix. Returns the signal name.
pub async fn wait_for_signal() -> eyre::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())
            .map_err(|e| eyre::eyre!("Failed to install SIGTERM handler: {}", e))?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => { r?; Ok("SIGINT") }
            _ = term.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}

/// Start every component in dependency order, run until a shutdown signal,
/// then stop them all. Any startup failure returns before a task is spawned.
pub async fn run(config: Config) -> eyre::Result<ShutdownOutcome> {
    let thresholds = config.rules.thresholds(config.chain.token_decimals)?;
    let watchlist = load_watchlist(&config.rules)?;
    let whitelist = load_whitelist(&config.rules)?;

    // Persistent store
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;
    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let seeded = seed_rules(store.as_ref(), &thresholds, &config.rules.suspicious_addresses).await?;
    tracing::info!(
        seeded,
        watchlist = watchlist.len(),
        whitelist = whitelist.len(),
        "Rules ready"
    );

    // Chain node must be reachable before anything starts
    let probe = ProviderBuilder::new().connect_http(
        config
            .chain
            .rpc_http
            .parse()
            .map_err(|e| eyre::eyre!("Invalid RPC URL: {}", e))?,
    );
    let tip = probe
        .get_block_number()
        .await
        .map_err(|e| eyre::eyre!("Cannot reach chain node at {}: {}", config.chain.rpc_http, e))?;
    tracing::info!(chain = %config.chain.name, tip, "Chain node reachable");

    // Signing key and restrict contract are loaded up front so a bad key is fatal
    let (enforcement_tx, enforcement) = if config.enforcement.enabled {
        let contract = parse_address(
            config
                .enforcement
                .restrict_contract
                .as_deref()
                .ok_or_else(|| eyre::eyre!("enforcement.restrict_contract is required"))?,
        )?;
        let submitter = ContractSubmitter::connect(
            &config.chain.rpc_http,
            contract,
            &config.enforcement.signing_key_env,
        )
        .await?;
        let (tx, rx) = mpsc::channel(config.enforcement.queue_capacity.max(1));
        let engine = EnforcementEngine::new(
            store.clone(),
            Arc::new(submitter),
            config.enforcement.batch_size,
            Duration::from_secs(config.enforcement.retry_interval_secs.max(1)),
        );
        (Some(tx), Some((engine, rx)))
    } else {
        tracing::warn!("Enforcement disabled, violations will be recorded but not enforced");
        (None, None)
    };

    let analyzer = Arc::new(WindowAnalyzer::new(
        store.clone(),
        thresholds,
        watchlist,
        enforcement_tx,
        config.analyzer.sweep_batch_size,
    )
    .with_whitelist(whitelist));
    analyzer.refresh_rules().await?;
    // Window history must be in place before the watchers deliver anything.
    analyzer.warm_up().await?;

    let pipeline = TransferPipeline::new(store.clone(), analyzer.clone());
    let confirmed = ConfirmedWatcher::new(config.chain.clone(), store.clone(), pipeline.clone())?;
    let pending = if config.pending.enabled {
        Some(PendingWatcher::new(
            config.chain.clone(),
            config.pending.clone(),
            store.clone(),
            pipeline,
        )?)
    } else {
        tracing::info!("Pending watcher disabled");
        None
    };

    let orchestrator = Orchestrator::new();
    let shutdown = orchestrator.shutdown_token();

    orchestrator.spawn(
        "analyzer-sweep",
        analyzer.run_sweep_loop(
            Duration::from_secs(config.analyzer.sweep_interval_secs.max(1)),
            shutdown.clone(),
        ),
    );
    orchestrator.spawn("confirmed-watcher", confirmed.run(shutdown.clone()));
    if let Some(watcher) = pending {
        orchestrator.spawn("pending-watcher", watcher.run(shutdown.clone()));
    }
    if let Some((engine, rx)) = enforcement {
        orchestrator.spawn("enforcement", engine.run(rx, shutdown.clone()));
    }

    tracing::info!(tasks = ?orchestrator.running_tasks(), "All tasks started. Press Ctrl+C to stop.");

    let signal = wait_for_signal().await?;
    tracing::info!(signal, "Shutdown signal received, stopping all tasks");

    Ok(orchestrator
        .shutdown(Duration::from_secs(config.shutdown.grace_period_secs))
        .await)
}
