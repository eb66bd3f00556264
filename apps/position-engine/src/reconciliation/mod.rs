//! Reconciliation between the registry and the exchange.
//!
//! The exchange is the source of truth. A pass compares the registry with
//! the exchange's positions keyed by `(symbol, side)`:
//!
//! 1. tracked but not held: the position was closed outside the engine; the
//!    exit is recovered from recent fills, booked and the leftovers cancelled;
//! 2. held with a different quantity: a smaller quantity is a missed partial
//!    close (shrink, or settle when only dust remains), a larger one is an
//!    external addition (adopt the exchange's quantity and entry);
//! 3. held but not tracked: adopted into the first enabled mode with room,
//!    with that mode's default stop and ladder, saved progress restored.
//!
//! Every correction re-checks the position under the registry lock, so a
//! pass that raced an exit or a take-profit leaves the position alone. Two
//! passes without an exchange change in between mutate nothing the second time.
//!
//! [`OrphanSweeper`] runs on its own cadence and cancels protective orders
//! that belong to no tracked position.

mod discrepancy;
mod orphan;
mod report;

pub use discrepancy::{Discrepancy, DiscrepancyKind, drift_pct};
pub use orphan::OrphanSweeper;
pub use report::{Deferral, OrphanKind, OrphanSweepReport, OrphanedOrder, ReconciliationReport};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::ConflictPolicy;
use crate::domain::{NewPosition, Position, ProtectionState, Provenance, Side, TradingMode};
use crate::execution::{CloseOutcome, ExecutionController};
use crate::gateway::ExchangePosition;
use crate::observability::metrics;
use crate::tpsl;

/// Registry/exchange reconciler.
pub struct ReconciliationEngine {
    controller: Arc<ExecutionController>,
    /// Dust left on the exchange by positions already settled, so the next
    /// pass does not adopt it back.
    residuals: Mutex<HashMap<(String, Side), Decimal>>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("residuals", &self.residuals.lock().len())
            .finish_non_exhaustive()
    }
}

enum Correction {
    Applied,
    Settled,
    Stale,
}

impl ReconciliationEngine {
    /// Create an engine acting through `controller`.
    #[must_use]
    pub fn new(controller: Arc<ExecutionController>) -> Self {
        Self {
            controller,
            residuals: Mutex::new(HashMap::new()),
        }
    }

    /// Run one reconciliation pass.
    pub async fn run_once(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        if !self.controller.config().reconciliation.enabled {
            return report;
        }

        // registry first: anything opened after this snapshot shows up as
        // held-but-tracked and is skipped by adoption
        let tracked = self.controller.registry().snapshot_all();
        report.tracked_positions = tracked.len();

        let exchange = match self.controller.gateway().positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation could not fetch exchange positions");
                report.errors.push(format!("positions: {e}"));
                return report;
            }
        };
        report.exchange_positions = exchange.len();

        let mut held: HashMap<(String, Side), ExchangePosition> = exchange
            .into_iter()
            .map(|p| ((p.symbol.clone(), p.side), p))
            .collect();
        self.residuals
            .lock()
            .retain(|key, qty| held.get(key).is_some_and(|p| p.quantity == *qty));

        for position in &tracked {
            match held.remove(&(position.symbol.clone(), position.side)) {
                None => self.settle_external(position, &mut report).await,
                Some(remote) => self.correct_quantity(position, &remote, &mut report).await,
            }
        }

        let mut untracked: Vec<ExchangePosition> = held.into_values().collect();
        untracked.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        for remote in &untracked {
            self.adopt(remote, &mut report).await;
        }

        if report.mutations() > 0 || !report.errors.is_empty() {
            tracing::info!(
                exchange = report.exchange_positions,
                tracked = report.tracked_positions,
                removed = report.removed.len(),
                adjusted = report.adjusted.len(),
                adopted = report.adopted.len(),
                deferred = report.deferred.len(),
                errors = report.errors.len(),
                "Reconciliation pass"
            );
        } else {
            tracing::debug!(
                exchange = report.exchange_positions,
                tracked = report.tracked_positions,
                "Reconciliation pass, no changes"
            );
        }
        report
    }

    async fn settle_external(&self, position: &Position, report: &mut ReconciliationReport) {
        let symbol = position.symbol.as_str();
        report.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::ExternallyClosed,
            symbol: symbol.to_string(),
            side: position.side,
            tracked_qty: position.remaining_qty(),
            exchange_qty: Decimal::ZERO,
        });

        // an exit in flight will settle it itself
        if self.controller.registry().begin_close(symbol).is_none() {
            report.deferred.push((symbol.to_string(), Deferral::Closing));
            return;
        }
        tracing::warn!(symbol = %symbol, side = %position.side, "Position closed outside the engine");
        if let CloseOutcome::Closed(_) = self.controller.settle_vanished(symbol).await {
            metrics::record_reconciliation(DiscrepancyKind::ExternallyClosed.as_str());
            report.removed.push(symbol.to_string());
        }
    }

    async fn correct_quantity(
        &self,
        position: &Position,
        remote: &ExchangePosition,
        report: &mut ReconciliationReport,
    ) {
        let config = &self.controller.config().reconciliation;
        let symbol = position.symbol.as_str();
        let tracked = position.remaining_qty();
        if drift_pct(tracked, remote.quantity) <= config.qty_tolerance_pct {
            return;
        }

        let kind = if remote.quantity < tracked {
            DiscrepancyKind::MissedPartialClose
        } else {
            DiscrepancyKind::ExternalAddition
        };
        report.discrepancies.push(Discrepancy {
            kind,
            symbol: symbol.to_string(),
            side: position.side,
            tracked_qty: tracked,
            exchange_qty: remote.quantity,
        });

        if position.is_closing() {
            report.deferred.push((symbol.to_string(), Deferral::Closing));
            return;
        }
        if config.conflict_policy == ConflictPolicy::DeferToGuardian
            && matches!(
                position.protection.state(),
                ProtectionState::PlacingStop | ProtectionState::PlacingTarget | ProtectionState::Healing
            )
        {
            tracing::debug!(symbol = %symbol, "Quantity correction deferred to the guardian");
            report.deferred.push((symbol.to_string(), Deferral::GuardianBusy));
            return;
        }

        let correction = match kind {
            DiscrepancyKind::MissedPartialClose => self.shrink(position, remote, report).await,
            _ => self.grow(position, remote),
        };
        match correction {
            Ok(Correction::Applied) => {
                metrics::record_reconciliation(kind.as_str());
                self.controller.persist(symbol);
                report.adjusted.push(symbol.to_string());
            }
            Ok(Correction::Settled) => {}
            Ok(Correction::Stale) => {
                report.deferred.push((symbol.to_string(), Deferral::Closing));
            }
            Err(message) => report.errors.push(message),
        }
    }

    async fn shrink(
        &self,
        position: &Position,
        remote: &ExchangePosition,
        report: &mut ReconciliationReport,
    ) -> Result<Correction, String> {
        let config = &self.controller.config().reconciliation;
        let symbol = position.symbol.as_str();
        let orders = self.controller.orders();
        let rules = orders
            .rules()
            .get(orders.gateway().as_ref(), symbol)
            .await
            .map_err(|e| format!("{symbol}: rules: {e}"))?;

        let floor = position.original_qty * config.remove_below_original_pct / Decimal::ONE_HUNDRED;
        if rules.is_dust(remote.quantity) || remote.quantity < floor {
            if self.controller.registry().begin_close(symbol).is_none() {
                return Ok(Correction::Stale);
            }
            tracing::warn!(
                symbol = %symbol,
                tracked = %position.remaining_qty(),
                exchange = %remote.quantity,
                "Remainder after missed partial close is negligible, settling"
            );
            self.residuals
                .lock()
                .insert((symbol.to_string(), position.side), remote.quantity);
            metrics::record_dust(symbol);
            if let CloseOutcome::Closed(_) = self.controller.settle_vanished(symbol).await {
                metrics::record_reconciliation(DiscrepancyKind::MissedPartialClose.as_str());
                report.removed.push(symbol.to_string());
            }
            return Ok(Correction::Settled);
        }

        let expected = position.remaining_qty();
        let applied = self.controller.registry().update(symbol, |p| {
            if p.is_closing() || p.remaining_qty() != expected {
                return false;
            }
            p.shrink_to(remote.quantity);
            true
        });
        if applied != Some(true) {
            return Ok(Correction::Stale);
        }
        tracing::warn!(
            symbol = %symbol,
            tracked = %expected,
            exchange = %remote.quantity,
            "Missed partial close, quantity shrunk"
        );
        Ok(Correction::Applied)
    }

    fn grow(&self, position: &Position, remote: &ExchangePosition) -> Result<Correction, String> {
        let symbol = position.symbol.as_str();
        let expected = position.remaining_qty();
        let applied = self.controller.registry().update(symbol, |p| {
            if p.is_closing() || p.remaining_qty() != expected {
                return false;
            }
            p.adopt_quantity(remote.quantity, remote.entry_price);
            true
        });
        if applied != Some(true) {
            return Ok(Correction::Stale);
        }
        tracing::warn!(
            symbol = %symbol,
            tracked = %expected,
            exchange = %remote.quantity,
            entry_price = %remote.entry_price,
            "External addition adopted"
        );
        Ok(Correction::Applied)
    }

    async fn adopt(&self, remote: &ExchangePosition, report: &mut ReconciliationReport) {
        let symbol = remote.symbol.as_str();
        let registry = self.controller.registry();
        if registry.contains(symbol) {
            // opened after the snapshot, or the opposite side is still closing
            return;
        }
        let residual = self
            .residuals
            .lock()
            .get(&(symbol.to_string(), remote.side))
            .copied();
        if residual == Some(remote.quantity) {
            return;
        }

        report.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::Untracked,
            symbol: symbol.to_string(),
            side: remote.side,
            tracked_qty: Decimal::ZERO,
            exchange_qty: remote.quantity,
        });
        if registry.is_claimed(symbol) {
            report.deferred.push((symbol.to_string(), Deferral::EntryInFlight));
            return;
        }

        let orders = self.controller.orders();
        let gateway = orders.gateway();
        let rules = match orders.rules().get(gateway.as_ref(), symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                report.errors.push(format!("{symbol}: rules: {e}"));
                return;
            }
        };
        if rules.is_dust(remote.quantity) {
            tracing::warn!(symbol = %symbol, quantity = %remote.quantity, "Untracked dust position left alone");
            report.deferred.push((symbol.to_string(), Deferral::Dust));
            return;
        }
        let balance = match gateway.balance().await {
            Ok(balance) => balance,
            Err(e) => {
                report.errors.push(format!("{symbol}: balance: {e}"));
                return;
            }
        };

        let entry_price = if remote.entry_price > Decimal::ZERO {
            remote.entry_price
        } else {
            remote.mark_price
        };
        let progress = self
            .controller
            .ledger()
            .snapshots()
            .get(symbol)
            .filter(|p| p.side == remote.side);
        let Some(mode) = self.choose_mode(
            progress.as_ref().map(|p| p.mode),
            remote.quantity * entry_price,
            remote.leverage,
            balance.total,
        ) else {
            tracing::warn!(
                symbol = %symbol,
                side = %remote.side,
                quantity = %remote.quantity,
                "No enabled mode has room for untracked position"
            );
            report.deferred.push((symbol.to_string(), Deferral::NoCapacity));
            return;
        };

        let mode_config = self.controller.config().modes.get(mode);
        let mut position = Position::open(
            NewPosition {
                symbol: symbol.to_string(),
                side: remote.side,
                mode,
                entry_price,
                quantity: remote.quantity,
                leverage: remote.leverage,
                stop_price: tpsl::default_stop(remote.side, entry_price, mode_config, &rules),
                take_profits: tpsl::build_ladder(remote.side, entry_price, mode_config, &rules, &[]),
                trailing: mode_config.trailing.params(),
                provenance: Provenance::Reconciled,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        );
        let restored = progress.is_some_and(|p| p.apply_to(&mut position));
        position.mode = mode;
        let stop_price = position.stop_price();
        let levels_hit = position.levels_hit();

        let committed = registry
            .try_claim(symbol)
            .is_some_and(|claim| claim.commit(position));
        if !committed {
            report.deferred.push((symbol.to_string(), Deferral::EntryInFlight));
            return;
        }
        metrics::record_reconciliation(DiscrepancyKind::Untracked.as_str());
        metrics::update_open_positions(registry.len());
        self.controller.persist(symbol);
        report.adopted.push(symbol.to_string());
        tracing::info!(
            symbol = %symbol,
            side = %remote.side,
            mode = %mode,
            quantity = %remote.quantity,
            entry_price = %entry_price,
            stop = %stop_price,
            levels_hit,
            restored,
            "Untracked position adopted"
        );

        // leftovers from a previous run are replaced by fresh protection
        orders.cancel_all(symbol, remote.side).await;
        match orders.establish(registry, symbol).await {
            Ok(state) => tracing::debug!(symbol = %symbol, state = %state, "Adopted position protected"),
            Err(e) => tracing::warn!(
                symbol = %symbol,
                error = %e,
                "Protection for adopted position failed, guardian will heal"
            ),
        }
        self.controller.persist(symbol);
    }

    /// Saved mode first, then the configured preference; first enabled mode
    /// whose allocation bucket admits the position.
    fn choose_mode(
        &self,
        saved: Option<TradingMode>,
        notional: Decimal,
        leverage: u32,
        balance: Decimal,
    ) -> Option<TradingMode> {
        let config = self.controller.config();
        let allocator = self.controller.risk().allocator();
        saved
            .into_iter()
            .chain(config.reconciliation.adoption_preference.iter().copied())
            .filter(|mode| config.modes.get(*mode).enabled)
            .find(|mode| match allocator.check(*mode, notional, leverage, balance) {
                Ok(()) => true,
                Err(denied) => {
                    tracing::debug!(mode = %mode, reason = %denied, "Mode declined adoption");
                    false
                }
            })
    }
}
