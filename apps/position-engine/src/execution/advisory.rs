//! Advisory stop-loss updates.
//!
//! An external advisor may propose a new stop for an open position. The
//! proposal is applied only if it passes three rules, checked in order:
//!
//! 1. it must tighten the stop (never widen it);
//! 2. it must not move the stop more than `max_move_pct` in one update;
//! 3. it must stay at least `min_distance_pct` away from the current price.
//!
//! Rejections are final for that proposal. Every attempt lands in the
//! per-symbol [`SlUpdateHistory`].

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::AdvisoryConfig;
use crate::domain::Side;

/// Advisor failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdvisoryError {
    /// The advisor could not be reached or produced no usable answer.
    #[error("advisor unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },
}

/// Source of stop-loss suggestions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdvisoryPort: Send + Sync {
    /// Suggest a stop for a position, or `None` to keep the current one.
    async fn suggest_stop(
        &self,
        symbol: &str,
        side: Side,
        mark: Decimal,
        current_stop: Decimal,
    ) -> Result<Option<Decimal>, AdvisoryError>;
}

/// Rule that rejected a proposed stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryRejection {
    /// Same as the current stop.
    #[error("proposed stop equals the current stop")]
    Unchanged,
    /// Would loosen protection.
    #[error("proposed stop widens the current stop")]
    WidensStop,
    /// Moves further than allowed in one step.
    #[error("proposed stop moves {move_pct}% in one update")]
    MoveTooLarge {
        /// Size of the move, percent of the current stop.
        move_pct: Decimal,
    },
    /// Sits too close to (or beyond) the current price.
    #[error("proposed stop is {distance_pct}% from the current price")]
    TooCloseToPrice {
        /// Distance on the protective side, percent of price.
        distance_pct: Decimal,
    },
}

impl AdvisoryRejection {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::WidensStop => "widens_stop",
            Self::MoveTooLarge { .. } => "move_too_large",
            Self::TooCloseToPrice { .. } => "too_close_to_price",
        }
    }
}

/// Check a proposed stop against the update rules.
pub fn validate_stop_update(
    side: Side,
    current: Decimal,
    proposed: Decimal,
    mark: Decimal,
    config: &AdvisoryConfig,
) -> Result<(), AdvisoryRejection> {
    if proposed == current {
        return Err(AdvisoryRejection::Unchanged);
    }
    if !side.is_tighter_stop(proposed, current) {
        return Err(AdvisoryRejection::WidensStop);
    }

    if !current.is_zero() {
        let move_pct = ((proposed - current) / current * dec!(100)).abs().round_dp(4);
        if move_pct > config.max_move_pct {
            return Err(AdvisoryRejection::MoveTooLarge { move_pct });
        }
    }

    if !mark.is_zero() {
        let distance_pct = ((mark - proposed) / mark * dec!(100) * side.sign()).round_dp(4);
        if distance_pct < config.min_distance_pct {
            return Err(AdvisoryRejection::TooCloseToPrice { distance_pct });
        }
    }
    Ok(())
}

/// One advisory update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlUpdateRecord {
    /// Attempt time.
    pub at: DateTime<Utc>,
    /// Stop before the attempt.
    pub previous: Decimal,
    /// Proposed stop.
    pub proposed: Decimal,
    /// Mark price at the time.
    pub mark: Decimal,
    /// Rule that rejected it, if any.
    pub rejection: Option<AdvisoryRejection>,
}

impl SlUpdateRecord {
    /// The update was applied.
    #[must_use]
    pub const fn accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Bounded per-symbol history of advisory updates.
#[derive(Debug)]
pub struct SlUpdateHistory {
    capacity: usize,
    records: Mutex<HashMap<String, VecDeque<SlUpdateRecord>>>,
}

impl SlUpdateHistory {
    /// History keeping the last `capacity` attempts per symbol.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Append an attempt, evicting the oldest beyond capacity.
    pub fn record(&self, symbol: &str, record: SlUpdateRecord) {
        let mut records = self.records.lock();
        let entries = records.entry(symbol.to_string()).or_default();
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Attempts for `symbol`, oldest first.
    #[must_use]
    pub fn for_symbol(&self, symbol: &str) -> Vec<SlUpdateRecord> {
        self.records
            .lock()
            .get(symbol)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a closed position's history.
    pub fn clear(&self, symbol: &str) {
        self.records.lock().remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Side::Long, dec!(95), dec!(97), dec!(100), None ; "long tightening accepted")]
    #[test_case(Side::Long, dec!(95), dec!(95), dec!(100), Some("unchanged") ; "no change")]
    #[test_case(Side::Long, dec!(95), dec!(94), dec!(100), Some("widens_stop") ; "long widening")]
    #[test_case(Side::Short, dec!(105), dec!(106), dec!(100), Some("widens_stop") ; "short widening")]
    #[test_case(Side::Long, dec!(80), dec!(90), dec!(100), Some("move_too_large") ; "long jump over limit")]
    #[test_case(Side::Long, dec!(95), dec!(99.8), dec!(100), Some("too_close_to_price") ; "long hugging price")]
    #[test_case(Side::Long, dec!(95), dec!(101), dec!(100), Some("too_close_to_price") ; "long stop beyond price")]
    #[test_case(Side::Short, dec!(105), dec!(102), dec!(100), None ; "short tightening accepted")]
    fn rules(side: Side, current: Decimal, proposed: Decimal, mark: Decimal, rejected: Option<&str>) {
        let result = validate_stop_update(side, current, proposed, mark, &AdvisoryConfig::default());
        assert_eq!(result.err().map(|r| r.label()), rejected);
    }

    #[test]
    fn widening_is_checked_before_move_size() {
        let err = validate_stop_update(Side::Long, dec!(95), dec!(50), dec!(100), &AdvisoryConfig::default())
            .unwrap_err();
        assert_eq!(err, AdvisoryRejection::WidensStop);
    }

    fn record(proposed: Decimal) -> SlUpdateRecord {
        SlUpdateRecord {
            at: Utc::now(),
            previous: dec!(95),
            proposed,
            mark: dec!(100),
            rejection: None,
        }
    }

    #[test]
    fn history_is_bounded_per_symbol() {
        let history = SlUpdateHistory::new(2);
        history.record("BTCUSDT", record(dec!(96)));
        history.record("BTCUSDT", record(dec!(97)));
        history.record("BTCUSDT", record(dec!(98)));
        history.record("ETHUSDT", record(dec!(1)));

        let btc: Vec<_> = history.for_symbol("BTCUSDT").iter().map(|r| r.proposed).collect();
        assert_eq!(btc, vec![dec!(97), dec!(98)]);
        assert_eq!(history.for_symbol("ETHUSDT").len(), 1);

        history.clear("BTCUSDT");
        assert!(history.for_symbol("BTCUSDT").is_empty());
    }

    #[tokio::test]
    async fn mocked_port_answers() {
        let mut port = MockAdvisoryPort::new();
        port.expect_suggest_stop()
            .returning(|_, _, _, _| Ok(Some(dec!(97))));
        let suggestion = port
            .suggest_stop("BTCUSDT", Side::Long, dec!(100), dec!(95))
            .await
            .unwrap();
        assert_eq!(suggestion, Some(dec!(97)));
    }
}
