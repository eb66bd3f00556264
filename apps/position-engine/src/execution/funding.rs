//! Funding-rate awareness for entries and open positions.
//!
//! Funding is expressed as the cost to the position's side in percent per
//! settlement: longs pay a positive rate, shorts pay a negative one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::FundingConfig;
use crate::domain::{Position, Side};
use crate::gateway::FundingInfo;

/// What funding means for a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingDecision {
    /// No adjustment.
    Proceed,
    /// Enter with a smaller size.
    Shrink {
        /// Multiplier applied to the sized notional.
        factor: Decimal,
        /// Cost to the side, percent.
        cost_pct: Decimal,
    },
    /// Do not enter before the next settlement.
    Block {
        /// Cost to the side, percent.
        cost_pct: Decimal,
    },
}

/// Funding cost for `side`, percent per settlement. Negative means the side is paid.
#[must_use]
pub fn cost_pct(side: Side, funding: &FundingInfo) -> Decimal {
    funding.rate * dec!(100) * side.sign()
}

/// Decide how funding affects an entry on `side`.
#[must_use]
pub fn assess_entry(
    config: &FundingConfig,
    side: Side,
    funding: Option<&FundingInfo>,
    now: DateTime<Utc>,
) -> FundingDecision {
    let Some(funding) = funding.filter(|_| config.enabled) else {
        return FundingDecision::Proceed;
    };
    let cost = cost_pct(side, funding);
    let until_settlement = funding.next_funding_at - now;

    if cost > config.block_threshold_pct
        && until_settlement >= chrono::Duration::zero()
        && until_settlement < chrono::Duration::minutes(config.block_window_mins)
    {
        return FundingDecision::Block { cost_pct: cost };
    }
    if cost > config.heavy_shrink_threshold_pct {
        return FundingDecision::Shrink {
            factor: dec!(0.5),
            cost_pct: cost,
        };
    }
    if cost > config.shrink_threshold_pct {
        return FundingDecision::Shrink {
            factor: dec!(0.75),
            cost_pct: cost,
        };
    }
    FundingDecision::Proceed
}

/// Whether a profitable position should be closed ahead of an expensive settlement.
#[must_use]
pub fn should_exit_before_funding(
    config: &FundingConfig,
    position: &Position,
    funding: &FundingInfo,
    mark: Decimal,
    now: DateTime<Utc>,
) -> bool {
    if !config.enabled {
        return false;
    }
    let until_settlement = funding.next_funding_at - now;
    if until_settlement < chrono::Duration::zero()
        || until_settlement > chrono::Duration::minutes(config.exit_window_mins)
    {
        return false;
    }
    let cost = cost_pct(position.side, funding);
    let profit = position.unrealized_at(mark);
    if cost <= Decimal::ZERO || profit <= Decimal::ZERO {
        return false;
    }
    let fee = mark * position.remaining_qty() * cost / dec!(100);
    fee > profit * config.exit_profit_share_pct / dec!(100) || cost > config.exit_rate_pct
}
