//! Differences between the registry and the exchange.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::Side;

/// Kind of disagreement found for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Tracked, but the exchange no longer holds it.
    ExternallyClosed,
    /// The exchange holds less than tracked: a partial close the engine missed.
    MissedPartialClose,
    /// The exchange holds more than tracked: an external addition.
    ExternalAddition,
    /// Held on the exchange, unknown to the registry.
    Untracked,
}

impl DiscrepancyKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExternallyClosed => "external_close",
            Self::MissedPartialClose => "shrink",
            Self::ExternalAddition => "grow",
            Self::Untracked => "adopt",
        }
    }
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected discrepancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    /// What disagrees.
    pub kind: DiscrepancyKind,
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Quantity the registry holds; zero when untracked.
    pub tracked_qty: Decimal,
    /// Quantity the exchange holds; zero when closed.
    pub exchange_qty: Decimal,
}

impl Discrepancy {
    /// Relative quantity drift against the tracked quantity, percent.
    /// Untracked positions count as 100.
    #[must_use]
    pub fn drift_pct(&self) -> Decimal {
        drift_pct(self.tracked_qty, self.exchange_qty)
    }
}

/// Relative drift of `exchange` against `tracked`, percent.
#[must_use]
pub fn drift_pct(tracked: Decimal, exchange: Decimal) -> Decimal {
    if tracked.is_zero() {
        return if exchange.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::ONE_HUNDRED
        };
    }
    ((exchange - tracked) / tracked * Decimal::ONE_HUNDRED).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    #[test_case(dec!(10), dec!(10), dec!(0) ; "equal")]
    #[test_case(dec!(10), dec!(9.95), dec!(0.5) ; "small shrink")]
    #[test_case(dec!(10), dec!(12), dec!(20) ; "growth")]
    #[test_case(dec!(0), dec!(3), dec!(100) ; "untracked")]
    #[test_case(dec!(0), dec!(0), dec!(0) ; "nothing on either side")]
    fn drift(tracked: Decimal, exchange: Decimal, expected: Decimal) {
        assert_eq!(drift_pct(tracked, exchange), expected);
    }

    #[test]
    fn labels_match_metric_kinds() {
        assert_eq!(DiscrepancyKind::ExternallyClosed.to_string(), "external_close");
        assert_eq!(DiscrepancyKind::Untracked.as_str(), "adopt");
    }
}
