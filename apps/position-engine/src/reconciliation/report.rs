//! Reconciliation and orphan sweep results.

use serde::Serialize;

use super::discrepancy::{Discrepancy, DiscrepancyKind};

/// Why a discrepancy was left unresolved this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Deferral {
    /// An entry for the symbol is in flight.
    EntryInFlight,
    /// An exit for the symbol is in flight.
    Closing,
    /// The guardian is placing or healing protection.
    GuardianBusy,
    /// No enabled mode has room for the position.
    NoCapacity,
    /// Quantity below the venue's minimum.
    Dust,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    /// Positions reported by the exchange.
    pub exchange_positions: usize,
    /// Positions in the registry at the start of the pass.
    pub tracked_positions: usize,
    /// Everything that disagreed.
    pub discrepancies: Vec<Discrepancy>,
    /// Symbols settled as closed (external close or dust removal).
    pub removed: Vec<String>,
    /// Symbols whose quantity was corrected.
    pub adjusted: Vec<String>,
    /// Symbols adopted from the exchange.
    pub adopted: Vec<String>,
    /// Discrepancies left for a later pass.
    pub deferred: Vec<(String, Deferral)>,
    /// Failures; the pass continues past them.
    pub errors: Vec<String>,
}

impl ReconciliationReport {
    /// Registry mutations made by the pass.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.removed.len() + self.adjusted.len() + self.adopted.len()
    }

    /// Nothing disagreed and nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty() && self.errors.is_empty()
    }

    /// Number of discrepancies of `kind`.
    #[must_use]
    pub fn count(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }
}

/// Why a protective order was cancelled by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    /// No tracked position for the symbol.
    UnknownSymbol,
    /// More protective orders than a position ever needs.
    ExcessOrders,
}

impl OrphanKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownSymbol => "unknown_symbol",
            Self::ExcessOrders => "excess_orders",
        }
    }
}

/// A protective order cancelled by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedOrder {
    /// Why.
    pub kind: OrphanKind,
    /// Symbol.
    pub symbol: String,
    /// Exchange order id.
    pub order_id: String,
}

/// Result of one orphan sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanSweepReport {
    /// Open orders inspected.
    pub orders_checked: usize,
    /// Orders cancelled.
    pub cancelled: Vec<OrphanedOrder>,
    /// Failures.
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn mutation_count_ignores_deferrals() {
        let report = ReconciliationReport {
            discrepancies: vec![Discrepancy {
                kind: DiscrepancyKind::Untracked,
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                tracked_qty: dec!(0),
                exchange_qty: dec!(1),
            }],
            adopted: vec!["BTCUSDT".to_string()],
            deferred: vec![("ETHUSDT".to_string(), Deferral::NoCapacity)],
            ..ReconciliationReport::default()
        };
        assert_eq!(report.mutations(), 1);
        assert_eq!(report.count(DiscrepancyKind::Untracked), 1);
        assert!(!report.is_clean());
        assert!(ReconciliationReport::default().is_clean());
    }
}
