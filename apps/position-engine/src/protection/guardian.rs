//! Protection guardian.
//!
//! Verifies on a fixed interval that every open position still has its stop
//! (and take-profit) on the exchange. A missing stop is healed by cancelling
//! any remnants and placing protection again; once the heal budget or the
//! maximum unprotected time is spent the position goes to `Emergency` and is
//! force-closed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ProtectionError, ProtectiveOrders};
use crate::config::ProtectionConfig;
use crate::domain::{Position, ProtectionState, ProtectionStatus, TransitionError};
use crate::gateway::{OrderKind, OrderSnapshot};
use crate::observability::metrics;
use crate::registry::PositionRegistry;

/// Force-closes a position whose protection cannot be restored.
#[async_trait]
pub trait EmergencyCloser: Send + Sync {
    /// Close `symbol` at market. Returns `true` if the position is closed.
    async fn emergency_close(&self, symbol: &str) -> bool;
}

/// Outcome of one guardian pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardianReport {
    /// Positions inspected.
    pub checked: usize,
    /// Positions whose stop was found live.
    pub verified: usize,
    /// Missing take-profits placed.
    pub targets_placed: usize,
    /// Successful heals.
    pub healed: usize,
    /// Failed heals.
    pub heal_failures: usize,
    /// Positions escalated to emergency.
    pub emergencies: usize,
    /// Dust positions needing manual handling.
    pub dust: Vec<String>,
}

impl GuardianReport {
    /// Anything beyond routine verification happened.
    #[must_use]
    pub fn has_activity(&self) -> bool {
        self.targets_placed + self.healed + self.heal_failures + self.emergencies > 0
    }
}

enum Escalation {
    Heal,
    Emergency,
    Skip,
}

/// Continuous protection verifier.
pub struct ProtectionGuardian {
    registry: Arc<PositionRegistry>,
    orders: Arc<ProtectiveOrders>,
    closer: Arc<dyn EmergencyCloser>,
    config: ProtectionConfig,
}

impl ProtectionGuardian {
    /// Create a guardian.
    #[must_use]
    pub fn new(
        registry: Arc<PositionRegistry>,
        orders: Arc<ProtectiveOrders>,
        closer: Arc<dyn EmergencyCloser>,
        config: ProtectionConfig,
    ) -> Self {
        Self {
            registry,
            orders,
            closer,
            config,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.guardian_interval_ms,
            max_heal_attempts = self.config.max_heal_attempts,
            max_unprotected_secs = self.config.max_unprotected_secs,
            "Protection guardian started"
        );

        let mut interval = tokio::time::interval(self.config.guardian_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Protection guardian shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_once().await;
                    if report.has_activity() {
                        tracing::info!(
                            checked = report.checked,
                            healed = report.healed,
                            heal_failures = report.heal_failures,
                            targets_placed = report.targets_placed,
                            emergencies = report.emergencies,
                            "Guardian pass"
                        );
                    } else {
                        tracing::debug!(checked = report.checked, verified = report.verified, "Guardian pass");
                    }
                }
            }
        }
    }

    /// Verify every open position once.
    pub async fn run_once(&self) -> GuardianReport {
        let mut report = GuardianReport::default();
        for position in self.registry.snapshot_all() {
            if position.is_closing() {
                continue;
            }
            report.checked += 1;
            if position.protection.dust {
                report.dust.push(position.symbol.clone());
                continue;
            }
            self.check(&position, &mut report).await;
        }
        report
    }

    async fn check(&self, position: &Position, report: &mut GuardianReport) {
        let symbol = position.symbol.as_str();
        let now = Utc::now();
        let state = position.protection.state();

        if state == ProtectionState::Emergency {
            tracing::error!(symbol = %symbol, "Retrying emergency close");
            self.closer.emergency_close(symbol).await;
            return;
        }

        let grace = chrono::Duration::seconds(self.config.placement_grace_secs as i64);
        if state.is_transitional() && now - position.protection.last_state_change < grace {
            return;
        }

        let orders = match self.orders.gateway().open_orders(Some(symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Guardian could not list orders");
                return;
            }
        };
        let live_stop = find_live(&orders, position, OrderKind::StopMarket, position.stop_order_id.as_deref());
        let live_target = find_live(
            &orders,
            position,
            OrderKind::TakeProfitMarket,
            position.target_order_id.as_deref(),
        );

        match live_stop {
            Some(stop) => {
                report.verified += 1;
                self.confirm(position, stop, live_target, report).await;
            }
            None => self.heal(position, report).await,
        }
    }

    async fn confirm(
        &self,
        position: &Position,
        stop: &OrderSnapshot,
        target: Option<&OrderSnapshot>,
        report: &mut GuardianReport,
    ) {
        let symbol = position.symbol.as_str();
        let target_ok = target.is_some() || position.next_pending_level().is_none();
        let now = Utc::now();

        let settled = self.registry.update(symbol, |p| {
            if p.is_closing() {
                return Ok(false);
            }
            p.stop_order_id = Some(stop.order_id.clone());
            p.protection.mark_stop_verified(now);
            match target {
                Some(target) => {
                    p.target_order_id = Some(target.order_id.clone());
                    p.protection.mark_target_verified(now);
                }
                None => {
                    p.target_order_id = None;
                    p.protection.mark_target_missing();
                }
            }
            settle_verified(&mut p.protection, target_ok, now).map(|()| !target_ok)
        });

        match settled {
            Some(Ok(true)) => match self.orders.restore_target(&self.registry, symbol).await {
                Ok(true) => report.targets_placed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Could not restore take-profit"),
            },
            Some(Ok(false)) | None => {}
            Some(Err(e)) => tracing::warn!(symbol = %symbol, error = %e, "Guardian state update rejected"),
        }
    }

    async fn heal(&self, position: &Position, report: &mut GuardianReport) {
        let symbol = position.symbol.as_str();
        let now = Utc::now();
        let max_attempts = self.config.max_heal_attempts;
        let max_unprotected = chrono::Duration::seconds(self.config.max_unprotected_secs as i64);

        let escalation = self
            .registry
            .update(symbol, |p| {
                if p.is_closing() {
                    return Escalation::Skip;
                }
                if let Err(e) = p.protection.mark_stop_missing(now) {
                    tracing::warn!(symbol = %symbol, error = %e, "Could not mark stop missing");
                }
                p.stop_order_id = None;

                let exhausted = p.protection.heal_attempts >= max_attempts
                    || p.protection.unprotected_for(now).unwrap_or_default() >= max_unprotected;
                let next = if exhausted {
                    ProtectionState::Emergency
                } else {
                    ProtectionState::Healing
                };
                match p.protection.transition(next, now) {
                    Ok(()) if exhausted => Escalation::Emergency,
                    Ok(()) => Escalation::Heal,
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, error = %e, "Guardian transition rejected");
                        Escalation::Skip
                    }
                }
            })
            .unwrap_or(Escalation::Skip);

        match escalation {
            Escalation::Skip => {}
            Escalation::Emergency => {
                tracing::error!(
                    symbol = %symbol,
                    heal_attempts = position.protection.heal_attempts,
                    "Protection could not be restored, emergency close"
                );
                metrics::record_emergency(symbol);
                report.emergencies += 1;
                if !self.closer.emergency_close(symbol).await {
                    tracing::error!(symbol = %symbol, "Emergency close did not complete, will retry");
                }
            }
            Escalation::Heal => {
                tracing::warn!(symbol = %symbol, "Stop missing on exchange, healing");
                let cleared = self.orders.cancel_all(symbol, position.side).await;
                if cleared > 0 {
                    tracing::debug!(symbol = %symbol, cleared, "Cleared protective remnants");
                }
                match self.orders.establish(&self.registry, symbol).await {
                    Ok(state) => {
                        tracing::info!(symbol = %symbol, state = %state, "Protection healed");
                        metrics::record_heal("healed");
                        report.healed += 1;
                    }
                    Err(ProtectionError::Dust { .. }) => report.dust.push(symbol.to_string()),
                    Err(ProtectionError::PositionGone { .. }) => {}
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, error = %e, "Heal attempt failed");
                        metrics::record_heal("failed");
                        report.heal_failures += 1;
                    }
                }
            }
        }
    }
}

/// The live order of `kind` protecting `position`, preferring the recorded id.
fn find_live<'a>(
    orders: &'a [OrderSnapshot],
    position: &Position,
    kind: OrderKind,
    known_id: Option<&str>,
) -> Option<&'a OrderSnapshot> {
    let mut live = orders
        .iter()
        .filter(|o| o.kind == kind && o.protects(position.side));
    let first = live.next()?;
    if known_id.is_none_or(|id| first.order_id == id) {
        return Some(first);
    }
    live.find(|o| Some(o.order_id.as_str()) == known_id)
        .or(Some(first))
}

/// Walk the state machine to `Protected` (target live or nothing left to
/// target) or `StopVerified` (target missing) after the stop was seen live.
fn settle_verified(
    status: &mut ProtectionStatus,
    target_ok: bool,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    use ProtectionState::{Healing, Opening, PlacingStop, PlacingTarget, Protected, StopVerified, Unprotected};

    let goal = if target_ok { Protected } else { StopVerified };
    if status.state() == goal {
        return Ok(());
    }
    match status.state() {
        Opening => {
            status.transition(PlacingStop, now)?;
            status.transition(StopVerified, now)?;
        }
        Unprotected => {
            status.transition(Healing, now)?;
            status.transition(StopVerified, now)?;
        }
        PlacingStop | PlacingTarget | Healing | Protected => status.transition(StopVerified, now)?,
        _ => {}
    }
    status.transition(goal, now)
}
