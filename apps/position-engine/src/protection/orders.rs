//! Placement of stop-loss and take-profit orders.
//!
//! Every method follows the registry discipline: read a snapshot, release the
//! lock, talk to the exchange, then re-acquire and check the position is still
//! there before recording order ids. An order placed for a position that
//! vanished in the meantime is cancelled again.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use super::ProtectionError;
use crate::domain::{ProtectionState, Side};
use crate::gateway::{
    GatewayError, OrderGateway, OrderRequest, OrderSnapshot, RetryPolicy, RulesCache,
    cancel_idempotent,
};
use crate::observability::metrics;
use crate::registry::PositionRegistry;

/// Places, replaces and cancels protective orders.
pub struct ProtectiveOrders {
    gateway: Arc<dyn OrderGateway>,
    retry: RetryPolicy,
    rules: Arc<RulesCache>,
}

impl std::fmt::Debug for ProtectiveOrders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectiveOrders")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ProtectiveOrders {
    /// Create the placer.
    #[must_use]
    pub fn new(gateway: Arc<dyn OrderGateway>, retry: RetryPolicy, rules: Arc<RulesCache>) -> Self {
        Self {
            gateway,
            retry,
            rules,
        }
    }

    /// Underlying gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    /// Shared instrument-rules cache.
    #[must_use]
    pub fn rules(&self) -> &Arc<RulesCache> {
        &self.rules
    }

    /// Place a close-position stop for `side`, retrying transient failures.
    pub async fn place_stop(
        &self,
        symbol: &str,
        side: Side,
        trigger: Decimal,
    ) -> Result<OrderSnapshot, GatewayError> {
        let request = OrderRequest::stop_loss(symbol, side, trigger);
        self.place("place_stop", request).await
    }

    /// Place a close-position take-profit for `side`, retrying transient failures.
    pub async fn place_target(
        &self,
        symbol: &str,
        side: Side,
        trigger: Decimal,
    ) -> Result<OrderSnapshot, GatewayError> {
        let request = OrderRequest::take_profit(symbol, side, trigger);
        self.place("place_target", request).await
    }

    async fn place(
        &self,
        operation: &str,
        request: OrderRequest,
    ) -> Result<OrderSnapshot, GatewayError> {
        let gateway = &self.gateway;
        let request = &request;
        self.retry
            .run(operation, || gateway.place_order(request.clone()))
            .await
    }

    /// Cancel every live protective order guarding `side` on `symbol`.
    ///
    /// Best effort: failures are logged and skipped. Returns how many orders
    /// were cancelled (or were already gone).
    pub async fn cancel_all(&self, symbol: &str, side: Side) -> usize {
        let orders = match self.gateway.open_orders(Some(symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Could not list orders to cancel");
                return 0;
            }
        };

        let mut cancelled = 0;
        for order in orders.iter().filter(|o| o.protects(side)) {
            match cancel_idempotent(self.gateway.as_ref(), symbol, &order.order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => tracing::warn!(
                    symbol = %symbol,
                    order_id = %order.order_id,
                    error = %e,
                    "Failed to cancel protective order"
                ),
            }
        }
        cancelled
    }

    /// Replace the live stop with one at `trigger`.
    ///
    /// The new stop goes in before the old one is cancelled, so the position
    /// is never without a stop. If the new stop cannot be placed the old one
    /// stays in force.
    pub async fn replace_stop(
        &self,
        registry: &PositionRegistry,
        symbol: &str,
        trigger: Decimal,
    ) -> Result<(), ProtectionError> {
        let (side, dust) = registry
            .get(symbol)
            .map(|p| (p.side, p.protection.dust))
            .ok_or_else(|| gone(symbol))?;
        if dust {
            tracing::debug!(symbol = %symbol, "Skipping stop replacement for dust position");
            return Ok(());
        }

        let placed = self
            .place_stop(symbol, side, trigger)
            .await
            .map_err(|source| ProtectionError::Placement {
                symbol: symbol.to_string(),
                source,
            })?;

        let now = Utc::now();
        let previous = registry.update(symbol, |p| {
            p.protection.mark_stop_verified(now);
            p.stop_order_id.replace(placed.order_id.clone())
        });
        let Some(previous) = previous else {
            self.discard(symbol, &placed.order_id).await;
            return Err(gone(symbol));
        };

        if let Some(old) = previous.filter(|old| *old != placed.order_id) {
            self.discard(symbol, &old).await;
        }
        tracing::info!(symbol = %symbol, stop = %trigger, order_id = %placed.order_id, "Stop replaced");
        Ok(())
    }

    /// Establish full protection: stop first, then the take-profit.
    ///
    /// The exchange take-profit sits at the last pending ladder level and
    /// closes whatever remains; intermediate levels are executed by the
    /// price monitor. Returns the state reached: `Protected`, or
    /// `StopVerified` when only the target failed.
    pub async fn establish(
        &self,
        registry: &PositionRegistry,
        symbol: &str,
    ) -> Result<ProtectionState, ProtectionError> {
        if !registry.contains(symbol) {
            return Err(gone(symbol));
        }
        let rules = self.rules.get(self.gateway.as_ref(), symbol).await?;
        let now = Utc::now();

        let prepared = registry
            .update(symbol, |p| -> Result<_, ProtectionError> {
                if p.protection.dust || rules.is_dust(p.remaining_qty()) {
                    p.protection.dust = true;
                    return Err(ProtectionError::Dust {
                        symbol: p.symbol.clone(),
                        quantity: p.remaining_qty(),
                    });
                }
                if p.protection.state() != ProtectionState::Healing {
                    p.protection.transition(ProtectionState::PlacingStop, now)?;
                }
                Ok((p.side, rules.round_stop(p.stop_price(), p.side)))
            })
            .ok_or_else(|| gone(symbol))?;

        let (side, stop_price) = match prepared {
            Ok(prepared) => prepared,
            Err(e @ ProtectionError::Dust { .. }) => {
                tracing::warn!(symbol = %symbol, "Position is dust, excluded from protection");
                metrics::record_dust(symbol);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let stop = match self.place_stop(symbol, side, stop_price).await {
            Ok(stop) => stop,
            Err(source) => {
                registry.update(symbol, |p| {
                    if let Err(e) = p.protection.mark_stop_missing(Utc::now()) {
                        tracing::warn!(symbol = %symbol, error = %e, "Could not record missing stop");
                    }
                });
                tracing::error!(symbol = %symbol, error = %source, "Stop placement failed");
                return Err(ProtectionError::Placement {
                    symbol: symbol.to_string(),
                    source,
                });
            }
        };

        let now = Utc::now();
        let recorded = registry.update(symbol, |p| -> Result<_, ProtectionError> {
            let previous = p.stop_order_id.replace(stop.order_id.clone());
            p.protection.mark_stop_verified(now);
            p.protection.transition(ProtectionState::StopVerified, now)?;
            let target = p
                .take_profits
                .iter()
                .rev()
                .find(|level| !level.is_hit())
                .map(|level| rules.round_target(level.price, p.side));
            Ok((previous, target))
        });
        let (previous, target) = match recorded {
            None => {
                self.discard(symbol, &stop.order_id).await;
                return Err(gone(symbol));
            }
            Some(recorded) => recorded?,
        };
        if let Some(old) = previous.filter(|old| *old != stop.order_id) {
            self.discard(symbol, &old).await;
        }
        tracing::info!(symbol = %symbol, stop = %stop_price, order_id = %stop.order_id, "Stop verified");

        let Some(target) = target else {
            registry
                .update(symbol, |p| p.protection.transition(ProtectionState::Protected, Utc::now()))
                .ok_or_else(|| gone(symbol))??;
            return Ok(ProtectionState::Protected);
        };

        registry
            .update(symbol, |p| p.protection.transition(ProtectionState::PlacingTarget, Utc::now()))
            .ok_or_else(|| gone(symbol))??;

        match self.attach_target(registry, symbol, side, target).await {
            Ok(()) => Ok(ProtectionState::Protected),
            Err(ProtectionError::Placement { source, .. }) => {
                tracing::warn!(
                    symbol = %symbol,
                    error = %source,
                    "Take-profit placement failed, stop remains in force"
                );
                Ok(ProtectionState::StopVerified)
            }
            Err(e) => Err(e),
        }
    }

    /// Place only the missing take-profit while the stop stays untouched.
    ///
    /// Returns `false` when there is no pending level left to protect.
    pub async fn restore_target(
        &self,
        registry: &PositionRegistry,
        symbol: &str,
    ) -> Result<bool, ProtectionError> {
        let rules = self.rules.get(self.gateway.as_ref(), symbol).await?;
        let now = Utc::now();
        let prepared = registry
            .update(symbol, |p| -> Result<_, ProtectionError> {
                let target = p
                    .take_profits
                    .iter()
                    .rev()
                    .find(|level| !level.is_hit())
                    .map(|level| rules.round_target(level.price, p.side));
                match target {
                    Some(price) => {
                        p.protection.transition(ProtectionState::PlacingTarget, now)?;
                        Ok(Some((p.side, price)))
                    }
                    None => {
                        p.protection.transition(ProtectionState::Protected, now)?;
                        Ok(None)
                    }
                }
            })
            .ok_or_else(|| gone(symbol))??;

        let Some((side, price)) = prepared else {
            return Ok(false);
        };
        self.attach_target(registry, symbol, side, price).await?;
        Ok(true)
    }

    /// Place the take-profit for a position in `PlacingTarget` and record the
    /// outcome. On failure the position falls back to `StopVerified`.
    async fn attach_target(
        &self,
        registry: &PositionRegistry,
        symbol: &str,
        side: Side,
        price: Decimal,
    ) -> Result<(), ProtectionError> {
        let placed = match self.place_target(symbol, side, price).await {
            Ok(placed) => placed,
            Err(source) => {
                registry.update(symbol, |p| {
                    p.protection.mark_target_missing();
                    if let Err(e) = p
                        .protection
                        .transition(ProtectionState::StopVerified, Utc::now())
                    {
                        tracing::warn!(symbol = %symbol, error = %e, "Could not fall back to stop-only");
                    }
                });
                return Err(ProtectionError::Placement {
                    symbol: symbol.to_string(),
                    source,
                });
            }
        };

        let now = Utc::now();
        let recorded = registry.update(symbol, |p| -> Result<_, ProtectionError> {
            let previous = p.target_order_id.replace(placed.order_id.clone());
            p.protection.mark_target_verified(now);
            p.protection.transition(ProtectionState::Protected, now)?;
            Ok(previous)
        });
        let previous = match recorded {
            None => {
                self.discard(symbol, &placed.order_id).await;
                return Err(gone(symbol));
            }
            Some(recorded) => recorded?,
        };
        if let Some(old) = previous.filter(|old| *old != placed.order_id) {
            self.discard(symbol, &old).await;
        }
        tracing::info!(symbol = %symbol, target = %price, order_id = %placed.order_id, "Take-profit verified");
        Ok(())
    }

    async fn discard(&self, symbol: &str, order_id: &str) {
        if let Err(e) = cancel_idempotent(self.gateway.as_ref(), symbol, order_id).await {
            tracing::warn!(symbol = %symbol, order_id = %order_id, error = %e, "Failed to cancel stale order");
        }
    }
}

fn gone(symbol: &str) -> ProtectionError {
    ProtectionError::PositionGone {
        symbol: symbol.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewPosition, Position, Provenance, TakeProfitLevel, TradingMode, TrailingParams};
    use crate::gateway::{ExchangePosition, GatewayOp, OrderKind, SimulatedExchange};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<SimulatedExchange>, ProtectiveOrders, PositionRegistry) {
        let exchange = Arc::new(SimulatedExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(100));
        exchange.inject_position(ExchangePosition {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        });
        let orders = ProtectiveOrders::new(
            exchange.clone(),
            RetryPolicy::immediate(3),
            Arc::new(RulesCache::new()),
        );
        let registry = PositionRegistry::new();
        registry.insert_if_absent(Position::open(
            NewPosition {
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                mode: TradingMode::Swing,
                entry_price: dec!(100),
                quantity: dec!(10),
                leverage: 10,
                stop_price: dec!(98),
                take_profits: vec![
                    TakeProfitLevel::pending(dec!(102), dec!(40), dec!(2)),
                    TakeProfitLevel::pending(dec!(104), dec!(30), dec!(4)),
                    TakeProfitLevel::pending(dec!(106), dec!(30), dec!(6)),
                ],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        ));
        (exchange, orders, registry)
    }

    #[tokio::test]
    async fn establish_places_stop_and_final_target() {
        let (exchange, orders, registry) = setup();

        let state = orders.establish(&registry, "BTCUSDT").await.unwrap();
        assert_eq!(state, ProtectionState::Protected);

        let stops = exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket);
        let targets = exchange.open_orders_of("BTCUSDT", OrderKind::TakeProfitMarket);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price, Some(dec!(98)));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].trigger_price, Some(dec!(106)));

        let position = registry.get("BTCUSDT").unwrap();
        assert_eq!(position.stop_order_id.as_deref(), Some(stops[0].order_id.as_str()));
        assert!(position.protection.stop_verified);
        assert!(position.protection.target_verified);
    }

    #[tokio::test]
    async fn stop_is_retried_on_transient_errors() {
        let (exchange, orders, registry) = setup();
        exchange.fail_times(GatewayOp::PlaceOrder, 2, GatewayError::Timeout);

        let state = orders.establish(&registry, "BTCUSDT").await.unwrap();
        assert_eq!(state, ProtectionState::Protected);
        assert_eq!(exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).len(), 1);
    }

    #[tokio::test]
    async fn exhausted_stop_placement_leaves_position_unprotected() {
        let (exchange, orders, registry) = setup();
        exchange.fail_times(GatewayOp::PlaceOrder, 3, GatewayError::Timeout);

        let err = orders.establish(&registry, "BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ProtectionError::Placement { .. }));
        let position = registry.get("BTCUSDT").unwrap();
        assert_eq!(position.protection.state(), ProtectionState::Unprotected);
        assert!(position.protection.unprotected_since.is_some());
    }

    #[tokio::test]
    async fn target_failure_falls_back_to_stop_verified() {
        let (exchange, orders, registry) = setup();
        orders.establish(&registry, "BTCUSDT").await.unwrap();
        let target_id = registry.get("BTCUSDT").unwrap().target_order_id.unwrap();
        exchange.delete_order(&target_id);
        registry.update("BTCUSDT", |p| {
            p.protection.transition(ProtectionState::StopVerified, Utc::now()).unwrap();
        });
        exchange.fail_times(GatewayOp::PlaceOrder, 3, GatewayError::Timeout);

        let err = orders.restore_target(&registry, "BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ProtectionError::Placement { .. }));

        let position = registry.get("BTCUSDT").unwrap();
        assert_eq!(position.protection.state(), ProtectionState::StopVerified);
        assert!(!position.protection.target_verified);
        assert!(position.protection.stop_verified);
    }

    #[tokio::test]
    async fn dust_position_is_flagged_and_never_placed() {
        let (exchange, orders, registry) = setup();
        registry.update("BTCUSDT", |p| p.shrink_to(dec!(0.0004)));

        let err = orders.establish(&registry, "BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ProtectionError::Dust { .. }));
        assert!(registry.get("BTCUSDT").unwrap().protection.dust);
        assert!(exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).is_empty());

        // A second attempt short-circuits on the flag.
        assert!(matches!(
            orders.establish(&registry, "BTCUSDT").await,
            Err(ProtectionError::Dust { .. })
        ));
    }

    #[tokio::test]
    async fn replace_stop_swaps_orders() {
        let (exchange, orders, registry) = setup();
        orders.establish(&registry, "BTCUSDT").await.unwrap();
        let old = registry.get("BTCUSDT").unwrap().stop_order_id.unwrap();

        orders.replace_stop(&registry, "BTCUSDT", dec!(100.1)).await.unwrap();

        let stops = exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price, Some(dec!(100.1)));
        assert_ne!(stops[0].order_id, old);
        assert_eq!(
            registry.get("BTCUSDT").unwrap().stop_order_id.as_deref(),
            Some(stops[0].order_id.as_str())
        );
    }

    #[tokio::test]
    async fn replace_stop_for_vanished_position_is_rejected() {
        let (exchange, orders, registry) = setup();
        registry.remove("BTCUSDT");
        let err = orders.replace_stop(&registry, "BTCUSDT", dec!(99)).await.unwrap_err();
        assert!(matches!(err, ProtectionError::PositionGone { .. }));
        assert!(exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).is_empty());
    }

    #[tokio::test]
    async fn restore_target_leaves_stop_alone() {
        let (exchange, orders, registry) = setup();
        orders.establish(&registry, "BTCUSDT").await.unwrap();
        let stop_id = registry.get("BTCUSDT").unwrap().stop_order_id.unwrap();
        let target_id = registry.get("BTCUSDT").unwrap().target_order_id.unwrap();
        exchange.delete_order(&target_id);
        registry.update("BTCUSDT", |p| {
            p.protection.mark_target_missing();
            p.protection.transition(ProtectionState::StopVerified, Utc::now()).unwrap();
        });

        assert!(orders.restore_target(&registry, "BTCUSDT").await.unwrap());

        let position = registry.get("BTCUSDT").unwrap();
        assert_eq!(position.stop_order_id.as_deref(), Some(stop_id.as_str()));
        assert_eq!(position.protection.state(), ProtectionState::Protected);
        assert_eq!(exchange.open_orders_of("BTCUSDT", OrderKind::TakeProfitMarket).len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_only_touches_protective_orders_for_the_side() {
        let (exchange, orders, registry) = setup();
        orders.establish(&registry, "BTCUSDT").await.unwrap();
        exchange
            .place_order(OrderRequest::limit("BTCUSDT", crate::domain::OrderSide::Buy, dec!(1), dec!(90)))
            .await
            .unwrap();

        assert_eq!(orders.cancel_all("BTCUSDT", Side::Long).await, 2);
        assert_eq!(orders.cancel_all("BTCUSDT", Side::Short).await, 0);
        assert_eq!(exchange.open_orders_of("BTCUSDT", OrderKind::Limit).len(), 1);
    }
}
