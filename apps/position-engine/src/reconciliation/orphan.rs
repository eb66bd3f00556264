//! Orphaned protective order sweep.
//!
//! A protective order whose symbol has no tracked position would open a new
//! position when it fires, so it is cancelled. A tracked symbol carrying far
//! more protective orders than a position needs (a stop and a take-profit)
//! has every one of them cancelled; the guardian then places a clean pair.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::report::{OrphanKind, OrphanSweepReport, OrphanedOrder};
use crate::config::ReconciliationConfig;
use crate::gateway::{OrderSnapshot, cancel_idempotent};
use crate::observability::metrics;
use crate::protection::ProtectiveOrders;
use crate::registry::PositionRegistry;

/// Periodic orphan order cleanup.
pub struct OrphanSweeper {
    registry: Arc<PositionRegistry>,
    orders: Arc<ProtectiveOrders>,
    config: ReconciliationConfig,
}

impl std::fmt::Debug for OrphanSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanSweeper")
            .field("max_orders_per_position", &self.config.max_orders_per_position)
            .finish_non_exhaustive()
    }
}

impl OrphanSweeper {
    /// Create a sweeper.
    #[must_use]
    pub const fn new(
        registry: Arc<PositionRegistry>,
        orders: Arc<ProtectiveOrders>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            registry,
            orders,
            config,
        }
    }

    /// Sweep once immediately, then every `orphan_sweep_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.orphan_sweep_interval().max(Duration::from_secs(1));
        tracing::info!(interval_secs = period.as_secs(), "Orphan sweeper started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Orphan sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once().await;
                    if report.cancelled.is_empty() {
                        tracing::debug!(checked = report.orders_checked, "Orphan sweep");
                    } else {
                        tracing::info!(
                            checked = report.orders_checked,
                            cancelled = report.cancelled.len(),
                            "Orphan sweep"
                        );
                    }
                }
            }
        }
    }

    /// Inspect every open order once.
    pub async fn sweep_once(&self) -> OrphanSweepReport {
        let mut report = OrphanSweepReport::default();
        let gateway = self.orders.gateway();
        let open = match gateway.open_orders(None).await {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!(error = %e, "Orphan sweep could not list open orders");
                report.errors.push(format!("open_orders: {e}"));
                return report;
            }
        };
        report.orders_checked = open.len();

        let mut by_symbol: BTreeMap<&str, Vec<&OrderSnapshot>> = BTreeMap::new();
        for order in open.iter().filter(|o| o.kind.is_protective()) {
            by_symbol.entry(order.symbol.as_str()).or_default().push(order);
        }

        for (symbol, orders) in by_symbol {
            let Some(position) = self.registry.get(symbol) else {
                if self.registry.is_claimed(symbol) {
                    continue;
                }
                for order in orders {
                    self.cancel(order, OrphanKind::UnknownSymbol, &mut report).await;
                }
                continue;
            };
            if position.is_closing() || orders.len() <= self.config.max_orders_per_position {
                continue;
            }

            tracing::warn!(
                symbol = %symbol,
                count = orders.len(),
                max = self.config.max_orders_per_position,
                "Excess protective orders, rebuilding protection"
            );
            for order in orders {
                self.cancel(order, OrphanKind::ExcessOrders, &mut report).await;
            }
            let now = Utc::now();
            self.registry.update(symbol, |p| {
                p.stop_order_id = None;
                p.target_order_id = None;
                if let Err(e) = p.protection.mark_stop_missing(now) {
                    tracing::warn!(symbol = %symbol, error = %e, "Could not record missing stop");
                }
            });
        }
        report
    }

    async fn cancel(&self, order: &OrderSnapshot, kind: OrphanKind, report: &mut OrphanSweepReport) {
        let gateway = self.orders.gateway();
        match cancel_idempotent(gateway.as_ref(), &order.symbol, &order.order_id).await {
            Ok(()) => {
                tracing::info!(
                    symbol = %order.symbol,
                    order_id = %order.order_id,
                    kind = %order.kind,
                    reason = kind.as_str(),
                    "Cancelled orphaned protective order"
                );
                metrics::record_orphan_cancelled(kind.as_str());
                report.cancelled.push(OrphanedOrder {
                    kind,
                    symbol: order.symbol.clone(),
                    order_id: order.order_id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %order.symbol,
                    order_id = %order.order_id,
                    error = %e,
                    "Failed to cancel orphaned order"
                );
                report.errors.push(format!("{}: cancel {}: {e}", order.symbol, order.order_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        NewPosition, Position, ProtectionState, Provenance, Side, TradingMode, TrailingParams,
    };
    use crate::gateway::{
        ExchangePosition, GatewayError, GatewayOp, OrderGateway, OrderKind, OrderRequest,
        RetryPolicy, RulesCache, SimulatedExchange,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<SimulatedExchange>, Arc<PositionRegistry>, OrphanSweeper) {
        let exchange = Arc::new(SimulatedExchange::new());
        for (symbol, price) in [("BTCUSDT", dec!(100)), ("ETHUSDT", dec!(2000))] {
            exchange.inject_position(ExchangePosition {
                symbol: symbol.to_string(),
                side: Side::Long,
                quantity: dec!(1),
                entry_price: price,
                mark_price: price,
                leverage: 5,
                unrealized_pnl: Decimal::ZERO,
            });
        }
        let registry = Arc::new(PositionRegistry::new());
        registry.insert_if_absent(Position::open(
            NewPosition {
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                mode: TradingMode::Swing,
                entry_price: dec!(100),
                quantity: dec!(1),
                leverage: 5,
                stop_price: dec!(98),
                take_profits: vec![],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        ));
        let orders = Arc::new(ProtectiveOrders::new(
            exchange.clone(),
            RetryPolicy::immediate(2),
            Arc::new(RulesCache::new()),
        ));
        let sweeper = OrphanSweeper::new(Arc::clone(&registry), orders, ReconciliationConfig::default());
        (exchange, registry, sweeper)
    }

    async fn stop(exchange: &SimulatedExchange, symbol: &str, trigger: Decimal) -> String {
        exchange
            .place_order(OrderRequest::stop_loss(symbol, Side::Long, trigger))
            .await
            .unwrap()
            .order_id
    }

    #[tokio::test]
    async fn untracked_symbol_orders_are_cancelled() {
        let (exchange, _registry, sweeper) = setup();
        let tracked = stop(&exchange, "BTCUSDT", dec!(98)).await;
        stop(&exchange, "ETHUSDT", dec!(1950)).await;

        let report = sweeper.sweep_once().await;
        assert_eq!(report.orders_checked, 2);
        assert_eq!(report.cancelled.len(), 1);
        assert_eq!(report.cancelled[0].symbol, "ETHUSDT");
        assert_eq!(report.cancelled[0].kind, OrphanKind::UnknownSymbol);

        let live = exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].order_id, tracked);
        assert!(exchange.open_orders_of("ETHUSDT", OrderKind::StopMarket).is_empty());
    }

    #[tokio::test]
    async fn excess_orders_are_cleared_for_the_guardian() {
        let (exchange, registry, sweeper) = setup();
        for trigger in [dec!(95), dec!(96), dec!(97), dec!(98), dec!(99)] {
            stop(&exchange, "BTCUSDT", trigger).await;
        }

        let report = sweeper.sweep_once().await;
        assert_eq!(report.cancelled.len(), 5);
        assert!(report.cancelled.iter().all(|o| o.kind == OrphanKind::ExcessOrders));
        assert!(exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).is_empty());
        assert_eq!(
            registry.get("BTCUSDT").unwrap().protection.state(),
            ProtectionState::Unprotected
        );
    }

    #[tokio::test]
    async fn normal_protection_is_left_alone() {
        let (exchange, _registry, sweeper) = setup();
        stop(&exchange, "BTCUSDT", dec!(98)).await;
        exchange
            .place_order(OrderRequest::take_profit("BTCUSDT", Side::Long, dec!(110)))
            .await
            .unwrap();

        let report = sweeper.sweep_once().await;
        assert!(report.cancelled.is_empty());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn listing_failure_is_reported() {
        let (exchange, _registry, sweeper) = setup();
        exchange.fail_next(GatewayOp::OpenOrders, GatewayError::Timeout);
        let report = sweeper.sweep_once().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.cancelled.is_empty());
    }
}
