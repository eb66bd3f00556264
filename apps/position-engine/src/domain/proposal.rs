//! Trade proposals from the upstream decision source.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::mode::TradingMode;
use super::position::{Provenance, Side};

/// What the decision source wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalAction {
    /// Open a long.
    Long,
    /// Open a short.
    Short,
    /// Do nothing.
    Wait,
    /// Close an existing position.
    Close,
}

/// How the entry order is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryType {
    /// Market order, fill verified before the position is tracked.
    Market,
    /// Resting limit order tracked as a pending entry until it fills or expires.
    Limit {
        /// Limit price.
        price: Decimal,
    },
}

/// A candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    /// Instrument symbol.
    pub symbol: String,
    /// Requested action.
    pub action: ProposalAction,
    /// Trading mode.
    pub mode: TradingMode,
    /// Confidence in `[0, 1]`.
    pub confidence: Decimal,
    /// Upper bound on notional size, in quote currency.
    #[serde(default)]
    pub size_hint_usd: Option<Decimal>,
    /// Suggested stop price; mode default when absent or on the wrong side.
    #[serde(default)]
    pub suggested_stop: Option<Decimal>,
    /// Suggested take-profit prices; mode ladder when empty.
    #[serde(default)]
    pub suggested_targets: Vec<Decimal>,
    /// Entry order type.
    pub entry: EntryType,
    /// Origin recorded on the position.
    pub provenance: Provenance,
    /// Optional leveraged-ROI profit-booking threshold.
    #[serde(default)]
    pub custom_roi_target_pct: Option<Decimal>,
}

impl TradeProposal {
    /// Minimal market proposal.
    #[must_use]
    pub fn market(
        symbol: impl Into<String>,
        action: ProposalAction,
        mode: TradingMode,
        confidence: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            mode,
            confidence,
            size_hint_usd: None,
            suggested_stop: None,
            suggested_targets: Vec::new(),
            entry: EntryType::Market,
            provenance: Provenance::Signal,
            custom_roi_target_pct: None,
        }
    }

    /// Direction, or `None` for non-directional actions.
    #[must_use]
    pub const fn side(&self) -> Option<Side> {
        match self.action {
            ProposalAction::Long => Some(Side::Long),
            ProposalAction::Short => Some(Side::Short),
            ProposalAction::Wait | ProposalAction::Close => None,
        }
    }

    /// Cap the notional size.
    #[must_use]
    pub const fn with_size_hint(mut self, usd: Decimal) -> Self {
        self.size_hint_usd = Some(usd);
        self
    }

    /// Set explicit stop and targets.
    #[must_use]
    pub fn with_protection(mut self, stop: Decimal, targets: Vec<Decimal>) -> Self {
        self.suggested_stop = Some(stop);
        self.suggested_targets = targets;
        self
    }

    /// Place the entry as a resting limit order.
    #[must_use]
    pub const fn with_limit_entry(mut self, price: Decimal) -> Self {
        self.entry = EntryType::Limit { price };
        self
    }
}
