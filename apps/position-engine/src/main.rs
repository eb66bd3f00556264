//! Position Engine Binary
//!
//! Runs the position engine in paper mode against the simulated exchange.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin position-engine
//! ```
//!
//! # Environment Variables
//!
//! - `POSITION_ENGINE_CONFIG`: YAML config path (default: `config.yaml`;
//!   built-in defaults when the default file is absent)
//! - `RUST_LOG`: overrides `observability.logging.level`
//!
//! Any `${VAR}` referenced from the YAML file is read from the environment,
//! after `.env` has been loaded.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use position_engine::config::Config;
use position_engine::observability::{init_metrics, init_tracing};
use position_engine::{
    Engine, InMemoryTradeJournal, JsonlTradeJournal, SimulatedExchange, SnapshotStore, TradeJournal,
    load_config,
};
use tokio::signal;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Config file read when `POSITION_ENGINE_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    let (config, source) = load_engine_config()?;
    init_tracing(&config.observability.logging);
    if config.observability.metrics.enabled {
        init_metrics(&config.observability.metrics).context("starting metrics exporter")?;
    }
    log_config(&config, &source);

    if !config.engine.paper {
        bail!("live trading needs an exchange adapter implementing OrderGateway; set engine.paper: true");
    }

    let snapshots = match &config.persistence.snapshot_path {
        Some(path) => SnapshotStore::open(path)
            .with_context(|| format!("opening snapshot file {}", path.display()))?,
        None => SnapshotStore::in_memory(),
    };
    let journal: Arc<dyn TradeJournal> = match &config.persistence.journal_path {
        Some(path) => Arc::new(JsonlTradeJournal::new(path)),
        None => Arc::new(InMemoryTradeJournal::new()),
    };
    let exchange = Arc::new(SimulatedExchange::new());

    let engine = Engine::new(config, exchange, journal, Arc::new(snapshots))?;
    let startup = engine.startup().await;
    if !startup.reconciliation.errors.is_empty() {
        tracing::warn!(errors = ?startup.reconciliation.errors, "Startup reconciliation incomplete");
    }
    engine.spawn();

    shutdown_signal().await;
    tracing::info!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Graceful shutdown started");
    let clean = engine.shutdown(SHUTDOWN_TIMEOUT).await;

    let status = engine.status();
    tracing::info!(
        open_positions = status.positions.len(),
        pending_entries = status.pending_entries,
        status = %serde_json::to_string(&status).unwrap_or_default(),
        "Final engine status"
    );
    if !clean {
        tracing::warn!("Some tasks were still running at exit");
    }
    Ok(())
}

/// Read the config file, or fall back to defaults when the default path is absent.
fn load_engine_config() -> anyhow::Result<(Config, String)> {
    if let Ok(path) = std::env::var("POSITION_ENGINE_CONFIG") {
        let config = load_config(Some(&path)).with_context(|| format!("loading {path}"))?;
        return Ok((config, path));
    }
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        let config = load_config(Some(DEFAULT_CONFIG_PATH))
            .with_context(|| format!("loading {DEFAULT_CONFIG_PATH}"))?;
        return Ok((config, DEFAULT_CONFIG_PATH.to_string()));
    }
    Ok((Config::default(), "built-in defaults".to_string()))
}

fn log_config(config: &Config, source: &str) {
    let modes: Vec<&str> = config.modes.enabled().map(|m| m.as_str()).collect();
    tracing::info!(
        source = %source,
        paper = config.engine.paper,
        risk_level = ?config.engine.risk_level,
        modes = ?modes,
        monitor_interval_ms = config.engine.monitor_interval_ms,
        guardian_interval_ms = config.protection.guardian_interval_ms,
        reconcile_every_ticks = config.engine.reconcile_every_ticks,
        conflict_policy = ?config.reconciliation.conflict_policy,
        metrics = config.observability.metrics.enabled,
        "Starting position engine"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
