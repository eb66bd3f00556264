//! Why a position left the book.

use serde::{Deserialize, Serialize};

/// Reason a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Stop-loss triggered.
    StopLoss,
    /// Final take-profit level executed.
    TakeProfit,
    /// Trailing stop triggered.
    TrailingStop,
    /// Leveraged ROI reached the position's custom target.
    CustomRoi,
    /// Maximum hold duration elapsed.
    MaxHold,
    /// Funding settlement would eat too much of the profit.
    FundingExit,
    /// Protection could not be restored.
    Emergency,
    /// Closed on the exchange without the engine.
    External,
    /// Operator or caller request.
    Manual,
}

impl CloseReason {
    /// Stable name used in logs, metrics and journal records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::TrailingStop => "trailing_stop",
            Self::CustomRoi => "custom_roi",
            Self::MaxHold => "max_hold",
            Self::FundingExit => "funding_exit",
            Self::Emergency => "emergency",
            Self::External => "external",
            Self::Manual => "manual",
        }
    }

    /// Exit must go out as a market order.
    #[must_use]
    pub const fn is_urgent(self) -> bool {
        matches!(self, Self::StopLoss | Self::TrailingStop | Self::Emergency)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
