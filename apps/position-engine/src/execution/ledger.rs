//! Bookkeeping for positions leaving the registry.
//!
//! Every removal path (engine close, external close found by reconciliation,
//! dust removal) ends in [`CloseLedger::settle`], so breakers, the blocklist,
//! the journal and the snapshot file all see the same closed trade.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

use crate::domain::{CloseReason, Position};
use crate::gateway::Fill;
use crate::observability::metrics;
use crate::persistence::{ClosedTradeRecord, SnapshotStore, TradeJournal};
use crate::registry::PositionRegistry;
use crate::risk::RiskGate;

/// Final exit of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSettlement {
    /// Quantity closed by the final exit.
    pub quantity: Decimal,
    /// Exit price; zero when unknown.
    pub exit_price: Decimal,
    /// PnL of the final exit, net of fees.
    pub pnl: Decimal,
    /// Why it closed.
    pub reason: CloseReason,
    /// When it closed.
    pub closed_at: DateTime<Utc>,
}

/// Exit recovered from the venue's fill history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveredExit {
    /// Closed quantity found in the fills.
    pub quantity: Decimal,
    /// Volume-weighted exit price; zero when nothing was found.
    pub price: Decimal,
    /// Venue-reported PnL net of fees.
    pub pnl: Decimal,
}

/// Reconstruct an exit the engine did not execute from recent fills.
///
/// Exit-side fills after the position opened are walked newest first until
/// the remaining quantity is covered; older fills belong to exits already
/// booked (partial take-profits). The last fill counted is pro-rated.
#[must_use]
pub fn recover_exit(position: &Position, fills: &[Fill]) -> RecoveredExit {
    let exit_side = position.side.exit_side();
    let mut closing: Vec<&Fill> = fills
        .iter()
        .filter(|f| f.symbol == position.symbol && f.side == exit_side && f.time >= position.opened_at)
        .collect();
    closing.sort_by(|a, b| b.time.cmp(&a.time));

    let wanted = position.remaining_qty();
    let mut quantity = Decimal::ZERO;
    let mut notional = Decimal::ZERO;
    let mut pnl = Decimal::ZERO;
    for fill in closing {
        if quantity >= wanted || fill.quantity.is_zero() {
            break;
        }
        let take = fill.quantity.min(wanted - quantity);
        let share = take / fill.quantity;
        quantity += take;
        notional += fill.price * take;
        pnl += (fill.realized_pnl - fill.fee) * share;
    }
    if quantity.is_zero() {
        return RecoveredExit::default();
    }

    let entry_fee_share = if position.original_qty.is_zero() {
        Decimal::ZERO
    } else {
        position.entry_fee * quantity / position.original_qty
    };
    RecoveredExit {
        quantity,
        price: notional / quantity,
        pnl: pnl - entry_fee_share,
    }
}

/// Records closed trades.
pub struct CloseLedger {
    registry: Arc<PositionRegistry>,
    risk: Arc<RiskGate>,
    journal: Arc<dyn TradeJournal>,
    snapshots: Arc<SnapshotStore>,
}

impl std::fmt::Debug for CloseLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseLedger").finish_non_exhaustive()
    }
}

impl CloseLedger {
    /// Create a ledger.
    #[must_use]
    pub fn new(
        registry: Arc<PositionRegistry>,
        risk: Arc<RiskGate>,
        journal: Arc<dyn TradeJournal>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            registry,
            risk,
            journal,
            snapshots,
        }
    }

    /// Snapshot store shared with the controller and reconciliation.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Record a position that has already been removed from the registry.
    pub fn settle(&self, position: &Position, exit: ExitSettlement) -> ClosedTradeRecord {
        let realized = position.realized_pnl + exit.pnl;
        let margin = position.initial_margin();
        let roi_pct = if margin.is_zero() {
            Decimal::ZERO
        } else {
            (realized / margin * dec!(100)).round_dp(4)
        };

        let record = ClosedTradeRecord {
            symbol: position.symbol.clone(),
            side: position.side,
            mode: position.mode,
            quantity: exit.quantity,
            entry_price: position.entry_price,
            exit_price: exit.exit_price,
            realized_pnl: realized,
            roi_pct,
            reason: exit.reason,
            provenance: position.provenance.clone(),
            opened_at: position.opened_at,
            closed_at: exit.closed_at,
        };

        self.risk
            .record_close(&position.symbol, position.mode, realized, roi_pct, exit.closed_at);
        if let Err(e) = self.journal.record(&record) {
            tracing::error!(symbol = %position.symbol, error = %e, "Failed to journal closed trade");
        }
        if let Err(e) = self.snapshots.remove(&position.symbol) {
            tracing::warn!(symbol = %position.symbol, error = %e, "Failed to drop position snapshot");
        }

        metrics::record_close(
            position.mode.as_str(),
            exit.reason.as_str(),
            realized.to_f64().unwrap_or_default(),
        );
        metrics::update_open_positions(self.registry.len());

        tracing::info!(
            symbol = %position.symbol,
            side = %position.side,
            mode = %position.mode.as_str(),
            reason = %exit.reason,
            exit_price = %exit.exit_price,
            pnl = %realized,
            roi_pct = %roi_pct,
            "Position closed"
        );
        record
    }
}
