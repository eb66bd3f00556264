//! Engine wiring and background tasks.
//!
//! [`Engine`] builds every component around one registry and one gateway,
//! reconciles against the exchange at startup and then runs the loops below,
//! each under [`supervise`] and sharing one cancellation token:
//!
//! | Task       | Cadence                         | Body                          |
//! |------------|---------------------------------|-------------------------------|
//! | `monitor`  | `engine.monitor_interval_ms`    | [`PositionMonitor::run_once`] |
//! | `guardian` | `protection.guardian_interval_ms` | [`ProtectionGuardian::run_once`] |
//! | `pending`  | `engine.pending_sweep_interval_ms` | [`ExecutionController::sweep_pending`] |
//! | `orphans`  | `reconciliation.orphan_sweep_interval_secs` | [`OrphanSweeper::sweep_once`] |
//! | `advisory` | per-mode `advisory_interval_secs` | [`AdvisoryPoller::run_once`] |

pub mod advisory;
pub mod monitor;
pub mod supervisor;

pub use advisory::{AdvisoryPoller, AdvisoryReport};
pub use monitor::{MonitorReport, PositionMonitor};
pub use supervisor::supervise;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, validate_config};
use crate::domain::{
    CloseReason, Position, ProtectionState, Provenance, Side, TradeProposal, TradingMode,
};
use crate::error::EngineError;
use crate::execution::{
    AdvisoryPort, CloseLedger, CloseOutcome, ExecutionController, ExecutionError, OpenOutcome,
};
use crate::gateway::{OrderGateway, RulesCache};
use crate::persistence::{SnapshotStore, TradeJournal};
use crate::protection::{EmergencyCloser, ProtectionGuardian, ProtectiveOrders};
use crate::reconciliation::{
    OrphanSweepReport, OrphanSweeper, ReconciliationEngine, ReconciliationReport,
};
use crate::registry::PositionRegistry;
use crate::risk::{AllocationStatus, BlockedInstrument, BreakerStatus, RiskGate};

/// Result of the startup pass.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    /// Initial reconciliation.
    pub reconciliation: ReconciliationReport,
    /// Initial orphan sweep.
    pub orphans: OrphanSweepReport,
}

/// One open position in a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionStatus {
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Mode.
    pub mode: TradingMode,
    /// Entry price.
    pub entry_price: Decimal,
    /// Quantity still open.
    pub remaining_qty: Decimal,
    /// Current stop.
    pub stop_price: Decimal,
    /// Take-profit levels executed.
    pub levels_hit: usize,
    /// Protection state.
    pub protection: ProtectionState,
    /// Exit in flight.
    pub closing: bool,
    /// Remainder below the venue minimum.
    pub dust: bool,
    /// Unrealized PnL at the last evaluated price.
    pub unrealized_pnl: Decimal,
    /// Where it came from.
    pub provenance: Provenance,
    /// Entry time.
    pub opened_at: DateTime<Utc>,
}

impl From<&Position> for PositionStatus {
    fn from(position: &Position) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            mode: position.mode,
            entry_price: position.entry_price,
            remaining_qty: position.remaining_qty(),
            stop_price: position.stop_price(),
            levels_hit: position.levels_hit(),
            protection: position.protection.state(),
            closing: position.is_closing(),
            dust: position.protection.dust,
            unrealized_pnl: position.unrealized_pnl,
            provenance: position.provenance.clone(),
            opened_at: position.opened_at,
        }
    }
}

/// Point-in-time engine view. Built from in-memory state only.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Paper trading.
    pub paper: bool,
    /// Open positions, by symbol.
    pub positions: Vec<PositionStatus>,
    /// Resting limit entries.
    pub pending_entries: usize,
    /// Balance seen at the last refresh.
    pub balance: Option<Decimal>,
    /// Capital use per base mode, against the last seen balance.
    pub allocation: Vec<AllocationStatus>,
    /// Global breaker first, then one per base mode.
    pub breakers: Vec<BreakerStatus>,
    /// Instruments refused for new entries.
    pub blocked: Vec<BlockedInstrument>,
}

impl StatusReport {
    /// Positions that are not fully protected.
    pub fn unprotected(&self) -> impl Iterator<Item = &PositionStatus> {
        self.positions
            .iter()
            .filter(|p| !p.dust && p.protection != ProtectionState::Protected)
    }

    /// Breakers currently refusing entries.
    pub fn paused(&self) -> impl Iterator<Item = &BreakerStatus> {
        self.breakers.iter().filter(|b| b.paused_until.is_some())
    }
}

/// The assembled position engine.
pub struct Engine {
    config: Arc<Config>,
    controller: Arc<ExecutionController>,
    reconciler: Arc<ReconciliationEngine>,
    guardian: Arc<ProtectionGuardian>,
    sweeper: Arc<OrphanSweeper>,
    monitor: Arc<PositionMonitor>,
    advisory: Option<Arc<AdvisoryPoller>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("positions", &self.controller.registry().len())
            .field("tasks", &self.tasks.lock().len())
            .field("advisory", &self.advisory.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validate `config` and wire every component around `gateway`.
    pub fn new(
        config: Config,
        gateway: Arc<dyn OrderGateway>,
        journal: Arc<dyn TradeJournal>,
        snapshots: Arc<SnapshotStore>,
    ) -> Result<Self, EngineError> {
        validate_config(&config)?;
        let config = Arc::new(config);

        let registry = Arc::new(PositionRegistry::new());
        let risk = Arc::new(RiskGate::new(&config, Arc::clone(&registry)));
        let orders = Arc::new(ProtectiveOrders::new(
            gateway,
            config.retry.clone(),
            Arc::new(RulesCache::new()),
        ));
        let ledger = Arc::new(CloseLedger::new(
            Arc::clone(&registry),
            Arc::clone(&risk),
            journal,
            snapshots,
        ));
        let controller = Arc::new(ExecutionController::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            risk,
            Arc::clone(&orders),
            ledger,
        ));

        let closer: Arc<dyn EmergencyCloser> = controller.clone();
        let guardian = Arc::new(ProtectionGuardian::new(
            Arc::clone(&registry),
            Arc::clone(&orders),
            closer,
            config.protection.clone(),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(Arc::clone(&controller)));
        let sweeper = Arc::new(OrphanSweeper::new(
            registry,
            orders,
            config.reconciliation.clone(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            Arc::clone(&controller),
            Arc::clone(&reconciler),
        ));

        Ok(Self {
            config,
            controller,
            reconciler,
            guardian,
            sweeper,
            monitor,
            advisory: None,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Poll `port` for stop suggestions when `advisory.enabled` is set.
    #[must_use]
    pub fn with_advisory(mut self, port: Arc<dyn AdvisoryPort>) -> Self {
        self.advisory = Some(Arc::new(AdvisoryPoller::new(Arc::clone(&self.controller), port)));
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The execution controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<ExecutionController> {
        &self.controller
    }

    /// The reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    /// The protection guardian.
    #[must_use]
    pub const fn guardian(&self) -> &Arc<ProtectionGuardian> {
        &self.guardian
    }

    /// The price monitor.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    /// Token cancelled by [`Engine::shutdown`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adopt whatever the exchange holds and clear stray protective orders.
    /// Run once before [`Engine::spawn`].
    pub async fn startup(&self) -> StartupReport {
        self.monitor.refresh_balance().await;
        let reconciliation = self.reconciler.run_once().await;
        let orphans = self.sweeper.sweep_once().await;
        tracing::info!(
            positions = self.controller.registry().len(),
            adopted = reconciliation.adopted.len(),
            removed = reconciliation.removed.len(),
            orphans_cancelled = orphans.cancelled.len(),
            "Engine startup reconciliation complete"
        );
        StartupReport {
            reconciliation,
            orphans,
        }
    }

    /// Start every background loop.
    pub fn spawn(&self) {
        let delay = self.config.engine.task_restart_delay();
        let mut tasks = self.tasks.lock();

        let guardian = Arc::clone(&self.guardian);
        tasks.push(supervise("guardian", self.cancel.clone(), delay, move |token| {
            let guardian = Arc::clone(&guardian);
            async move { guardian.run(token).await }
        }));

        let monitor = Arc::clone(&self.monitor);
        tasks.push(supervise("monitor", self.cancel.clone(), delay, move |token| {
            let monitor = Arc::clone(&monitor);
            async move { monitor.run(token).await }
        }));

        let controller = Arc::clone(&self.controller);
        tasks.push(supervise("pending", self.cancel.clone(), delay, move |token| {
            let controller = Arc::clone(&controller);
            async move { run_pending_sweep(&controller, token).await }
        }));

        if self.config.reconciliation.enabled {
            let sweeper = Arc::clone(&self.sweeper);
            tasks.push(supervise("orphans", self.cancel.clone(), delay, move |token| {
                let sweeper = Arc::clone(&sweeper);
                async move { sweeper.run(token).await }
            }));
        }

        if let Some(poller) = self.advisory.as_ref().filter(|_| self.config.advisory.enabled) {
            let poller = Arc::clone(poller);
            tasks.push(supervise("advisory", self.cancel.clone(), delay, move |token| {
                let poller = Arc::clone(&poller);
                async move { poller.run(token).await }
            }));
        }

        tracing::info!(tasks = tasks.len(), "Engine tasks started");
    }

    /// Submit a trade proposal.
    pub async fn submit(&self, proposal: TradeProposal) -> Result<OpenOutcome, EngineError> {
        Ok(self.controller.open_position(proposal).await?)
    }

    /// Close one position.
    pub async fn close(&self, symbol: &str, reason: CloseReason) -> Result<CloseOutcome, EngineError> {
        Ok(self.controller.close_position(symbol, reason).await?)
    }

    /// Close every position.
    pub async fn close_all(
        &self,
        reason: CloseReason,
    ) -> Vec<(String, Result<CloseOutcome, ExecutionError>)> {
        self.controller.close_all(reason).await
    }

    /// Build a status view without calling the exchange.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let now = Utc::now();
        let registry = self.controller.registry();
        let risk = self.controller.risk();
        let balance = self.monitor.last_balance().map(|b| b.total);
        StatusReport {
            generated_at: now,
            paper: self.config.engine.paper,
            positions: registry.snapshot_all().iter().map(PositionStatus::from).collect(),
            pending_entries: self.controller.pending().len(),
            balance,
            allocation: risk.allocator().status(balance.unwrap_or_default()),
            breakers: risk.breaker_statuses(now),
            blocked: risk.blocklist().blocked(now),
        }
    }

    /// Cancel every task and wait up to `timeout` for them to stop.
    ///
    /// Open positions stay open; their exchange protection remains in place.
    /// Returns `false` if some task did not stop in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let count = tasks.len();
        match tokio::time::timeout(timeout, join_all(tasks)).await {
            Ok(_) => {
                tracing::info!(tasks = count, "Engine stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    tasks = count,
                    timeout_secs = timeout.as_secs(),
                    "Engine tasks did not stop before the timeout"
                );
                false
            }
        }
    }
}

async fn run_pending_sweep(controller: &ExecutionController, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(controller.config().engine.pending_sweep_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if controller.pending().is_empty() {
                    continue;
                }
                let report = controller.sweep_pending(Utc::now()).await;
                if !report.opened.is_empty() || !report.cancelled.is_empty() {
                    tracing::info!(
                        opened = report.opened.len(),
                        cancelled = report.cancelled.len(),
                        waiting = report.waiting,
                        "Pending entries swept"
                    );
                }
            }
        }
    }
}
