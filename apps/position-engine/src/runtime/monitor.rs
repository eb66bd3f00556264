//! Price-driven position monitor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::{CloseReason, Position};
use crate::execution::{CloseOutcome, ExecutionController, should_exit_before_funding};
use crate::gateway::Balance;
use crate::reconciliation::{ReconciliationEngine, ReconciliationReport};
use crate::tpsl::{self, Tick, TickAction};

/// What one monitor tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    /// Positions evaluated against a fresh mark price.
    pub evaluated: usize,
    /// Full closes executed, with their reason.
    pub closed: Vec<(String, CloseReason)>,
    /// Partial take-profits executed.
    pub take_profits: Vec<(String, usize)>,
    /// Exchange stop moves applied.
    pub stop_moves: usize,
    /// Failures; the tick continues past them.
    pub errors: Vec<String>,
    /// Reconciliation pass run on this tick, if any.
    pub reconciliation: Option<ReconciliationReport>,
}

impl MonitorReport {
    /// Anything was executed on the exchange.
    #[must_use]
    pub fn has_activity(&self) -> bool {
        !self.closed.is_empty() || !self.take_profits.is_empty() || self.stop_moves > 0
    }
}

/// Evaluates every tracked position on each tick and runs the resulting
/// exits and stop moves through the controller. Every
/// `reconcile_every_ticks` ticks it also reconciles against the exchange.
pub struct PositionMonitor {
    controller: Arc<ExecutionController>,
    reconciler: Arc<ReconciliationEngine>,
    ticks: AtomicU64,
    balance: Mutex<Option<Balance>>,
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PositionMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(controller: Arc<ExecutionController>, reconciler: Arc<ReconciliationEngine>) -> Self {
        Self {
            controller,
            reconciler,
            ticks: AtomicU64::new(0),
            balance: Mutex::new(None),
        }
    }

    /// Account balance seen at the last reconciliation tick.
    #[must_use]
    pub fn last_balance(&self) -> Option<Balance> {
        *self.balance.lock()
    }

    /// Refresh the cached balance from the exchange.
    pub async fn refresh_balance(&self) {
        match self.controller.gateway().balance().await {
            Ok(balance) => *self.balance.lock() = Some(balance),
            Err(e) => tracing::debug!(error = %e, "Balance refresh failed"),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let engine = &self.controller.config().engine;
        tracing::info!(
            interval_ms = engine.monitor_interval_ms,
            reconcile_every_ticks = engine.reconcile_every_ticks,
            "Position monitor started"
        );

        let mut interval = tokio::time::interval(engine.monitor_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Position monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_once(Utc::now()).await;
                    if report.has_activity() || !report.errors.is_empty() {
                        tracing::info!(
                            evaluated = report.evaluated,
                            closed = report.closed.len(),
                            take_profits = report.take_profits.len(),
                            stop_moves = report.stop_moves,
                            errors = report.errors.len(),
                            "Monitor tick"
                        );
                    }
                }
            }
        }
    }

    /// Evaluate every open position once at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> MonitorReport {
        let mut report = MonitorReport::default();
        self.controller.risk().roll_counters(now);

        for position in self.controller.registry().snapshot_all() {
            if position.is_closing() {
                continue;
            }
            self.evaluate(&position, now, &mut report).await;
        }

        let every = u64::from(self.controller.config().engine.reconcile_every_ticks);
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if every > 0 && tick % every == 0 {
            self.refresh_balance().await;
            report.reconciliation = Some(self.reconciler.run_once().await);
        }
        report
    }

    async fn evaluate(&self, position: &Position, now: DateTime<Utc>, report: &mut MonitorReport) {
        let controller = &self.controller;
        let config = controller.config();
        let gateway = controller.gateway();
        let symbol = position.symbol.as_str();

        let mark = match gateway.mark_price(symbol).await {
            Ok(mark) => mark,
            Err(e) => {
                tracing::debug!(symbol = %symbol, error = %e, "Mark price unavailable, skipping tick");
                report.errors.push(format!("{symbol}: mark price: {e}"));
                return;
            }
        };
        let rules = match controller.orders().rules().get(gateway.as_ref(), symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                report.errors.push(format!("{symbol}: rules: {e}"));
                return;
            }
        };

        let actions = controller.registry().update(symbol, |p| {
            let tick = Tick {
                price: mark,
                now,
                mode: config.modes.get(p.mode),
                tolerance_pct: config.engine.trigger_tolerance_pct,
                rules: &rules,
            };
            tpsl::evaluate(p, &tick)
        });
        let Some(actions) = actions else {
            return;
        };
        report.evaluated += 1;

        if actions.is_empty() {
            self.check_funding(symbol, mark, now, report).await;
            return;
        }
        for action in actions {
            self.execute(symbol, action, report).await;
        }
    }

    async fn execute(&self, symbol: &str, action: TickAction, report: &mut MonitorReport) {
        match action {
            TickAction::Close { reason } => match self.controller.close_position(symbol, reason).await {
                Ok(CloseOutcome::Closed(_)) => report.closed.push((symbol.to_string(), reason)),
                Ok(CloseOutcome::Partial { .. } | CloseOutcome::Skipped) => {}
                Err(e) => report.errors.push(format!("{symbol}: close: {e}")),
            },
            TickAction::TakeProfit {
                level,
                quantity,
                final_level,
            } => match self
                .controller
                .execute_take_profit(symbol, level, quantity, final_level)
                .await
            {
                Ok(true) if final_level => report.closed.push((symbol.to_string(), CloseReason::TakeProfit)),
                Ok(true) => report.take_profits.push((symbol.to_string(), level)),
                Ok(false) => {}
                Err(e) => report.errors.push(format!("{symbol}: take-profit {}: {e}", level + 1)),
            },
            TickAction::MoveStop { price, cause } => {
                match self.controller.push_stop(symbol, price, cause).await {
                    Ok(()) => report.stop_moves += 1,
                    Err(e) => report.errors.push(format!("{symbol}: stop move: {e}")),
                }
            }
        }
    }

    async fn check_funding(
        &self,
        symbol: &str,
        mark: rust_decimal::Decimal,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) {
        let config = &self.controller.config().funding;
        if !config.enabled {
            return;
        }
        let funding = match self.controller.gateway().funding(symbol).await {
            Ok(Some(funding)) => funding,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(symbol = %symbol, error = %e, "Funding lookup failed");
                return;
            }
        };
        let Some(position) = self.controller.registry().get(symbol).filter(|p| !p.is_closing()) else {
            return;
        };
        if !should_exit_before_funding(config, &position, &funding, mark, now) {
            return;
        }
        tracing::info!(
            symbol = %symbol,
            rate = %funding.rate,
            next_funding_at = %funding.next_funding_at,
            "Closing ahead of funding settlement"
        );
        self.execute(
            symbol,
            TickAction::Close {
                reason: CloseReason::FundingExit,
            },
            report,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::{ProposalAction, Side, TradeProposal, TradingMode};
    use crate::execution::CloseLedger;
    use crate::gateway::{FundingInfo, GatewayError, GatewayOp, OrderKind, RetryPolicy, RulesCache, SimulatedExchange};
    use crate::persistence::{InMemoryTradeJournal, SnapshotStore};
    use crate::protection::ProtectiveOrders;
    use crate::registry::PositionRegistry;
    use crate::risk::RiskGate;
    use rust_decimal_macros::dec;

    struct Harness {
        exchange: Arc<SimulatedExchange>,
        registry: Arc<PositionRegistry>,
        journal: Arc<InMemoryTradeJournal>,
        controller: Arc<ExecutionController>,
        monitor: PositionMonitor,
    }

    fn harness_with(config: Config) -> Harness {
        let exchange = Arc::new(SimulatedExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(100));
        let config = Arc::new(config);
        let registry = Arc::new(PositionRegistry::new());
        let risk = Arc::new(RiskGate::new(&config, Arc::clone(&registry)));
        let orders = Arc::new(ProtectiveOrders::new(
            exchange.clone(),
            config.retry.clone(),
            Arc::new(RulesCache::new()),
        ));
        let journal = Arc::new(InMemoryTradeJournal::new());
        let ledger = Arc::new(CloseLedger::new(
            Arc::clone(&registry),
            Arc::clone(&risk),
            journal.clone(),
            Arc::new(SnapshotStore::in_memory()),
        ));
        let controller = Arc::new(ExecutionController::new(
            config,
            Arc::clone(&registry),
            risk,
            orders,
            ledger,
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(Arc::clone(&controller)));
        Harness {
            exchange,
            registry,
            journal,
            monitor: PositionMonitor::new(Arc::clone(&controller), reconciler),
            controller,
        }
    }

    fn harness() -> Harness {
        let mut config = Config::default();
        config.retry = RetryPolicy::immediate(3);
        config.entry.fill_poll_interval_ms = 0;
        config.engine.reconcile_every_ticks = 0;
        harness_with(config)
    }

    async fn open_btc(h: &Harness) {
        let proposal = TradeProposal::market("BTCUSDT", ProposalAction::Long, TradingMode::Swing, dec!(0.5));
        assert!(h.controller.open_position(proposal).await.unwrap().is_opened());
    }

    #[tokio::test]
    async fn quiet_market_changes_nothing() {
        let h = harness();
        open_btc(&h).await;
        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.evaluated, 1);
        assert!(!report.has_activity());
        assert_eq!(h.registry.get("BTCUSDT").unwrap().stop_price(), dec!(98));
    }

    #[tokio::test]
    async fn first_target_takes_partial_profit_then_trailing_follows() {
        let h = harness();
        open_btc(&h).await;

        h.exchange.set_mark_price("BTCUSDT", dec!(103));
        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.take_profits, vec![("BTCUSDT".to_string(), 0)]);
        let position = h.registry.get("BTCUSDT").unwrap();
        assert_eq!(position.remaining_qty(), dec!(1.02));
        assert_eq!(position.stop_price(), dec!(100.1));

        // 3% in profit: trailing arms and ratchets above breakeven
        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.stop_moves, 1);
        let position = h.registry.get("BTCUSDT").unwrap();
        assert!(position.trailing_active);
        assert!(position.stop_price() > dec!(100.1));
        let stops = h.exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price, Some(position.stop_price()));

        h.exchange.set_mark_price("BTCUSDT", dec!(100));
        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.closed, vec![("BTCUSDT".to_string(), CloseReason::TrailingStop)]);
        assert!(h.registry.is_empty());
        assert_eq!(h.journal.trades()[0].reason, CloseReason::TrailingStop);
    }

    #[tokio::test]
    async fn stop_breach_closes_the_position() {
        let h = harness();
        open_btc(&h).await;
        h.exchange.set_mark_price("BTCUSDT", dec!(97.5));

        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.closed, vec![("BTCUSDT".to_string(), CloseReason::StopLoss)]);
        assert!(h.exchange.position("BTCUSDT", Side::Long).is_none());
        assert!(h.exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).is_empty());
    }

    #[tokio::test]
    async fn expensive_settlement_closes_a_profitable_position() {
        let h = harness();
        open_btc(&h).await;
        h.exchange.set_mark_price("BTCUSDT", dec!(101));
        h.exchange.set_funding(
            "BTCUSDT",
            FundingInfo {
                rate: dec!(0.004),
                next_funding_at: Utc::now() + chrono::Duration::minutes(5),
            },
        );

        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.closed, vec![("BTCUSDT".to_string(), CloseReason::FundingExit)]);
        assert_eq!(h.journal.trades()[0].reason, CloseReason::FundingExit);
    }

    #[tokio::test]
    async fn missing_price_skips_the_position() {
        let h = harness();
        open_btc(&h).await;
        h.exchange.fail_next(GatewayOp::MarkPrice, GatewayError::Timeout);

        let report = h.monitor.run_once(Utc::now()).await;
        assert_eq!(report.evaluated, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(h.registry.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn reconciliation_runs_on_its_tick() {
        let mut config = Config::default();
        config.retry = RetryPolicy::immediate(3);
        config.entry.fill_poll_interval_ms = 0;
        config.engine.reconcile_every_ticks = 2;
        let h = harness_with(config);
        open_btc(&h).await;
        h.exchange.close_externally("BTCUSDT", Side::Long);

        let first = h.monitor.run_once(Utc::now()).await;
        assert!(first.reconciliation.is_none());
        assert!(h.registry.contains("BTCUSDT"));

        let second = h.monitor.run_once(Utc::now()).await;
        let reconciliation = second.reconciliation.unwrap();
        assert_eq!(reconciliation.removed, vec!["BTCUSDT".to_string()]);
        assert!(h.registry.is_empty());
        assert!(h.monitor.last_balance().is_some());
    }
}
