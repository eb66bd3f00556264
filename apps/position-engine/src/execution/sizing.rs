//! Adaptive position sizing.
//!
//! ```text
//! usable   = available × usable_balance_pct
//! slot     = usable × allocation_pct / max_positions × leverage
//! notional = min(base, slot) × risk multiplier × (0.5 + 0.7 × confidence)
//!            clamped to [min, max] of the mode, capped by the size hint
//! ```

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::{EntryConfig, ModeConfig, RiskLevel};
use crate::risk::RejectReason;

/// Computes entry notional from balance, risk tier and confidence.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    entry: EntryConfig,
    risk_level: RiskLevel,
}

impl PositionSizer {
    /// Create a sizer.
    #[must_use]
    pub const fn new(entry: EntryConfig, risk_level: RiskLevel) -> Self {
        Self { entry, risk_level }
    }

    /// Balance the sizer is allowed to commit.
    #[must_use]
    pub fn usable_balance(&self, available: Decimal) -> Decimal {
        available * self.entry.usable_balance_pct / dec!(100)
    }

    /// Notional for a new entry in quote currency.
    pub fn size(
        &self,
        available: Decimal,
        mode: &ModeConfig,
        confidence: Decimal,
        size_hint: Option<Decimal>,
    ) -> Result<Decimal, RejectReason> {
        let usable = self.usable_balance(available);
        if usable < self.entry.min_balance_usd {
            return Err(RejectReason::InsufficientBalance {
                usable,
                minimum: self.entry.min_balance_usd,
            });
        }

        let slots = Decimal::from(mode.max_positions.max(1));
        let slot = usable * mode.allocation_pct / dec!(100) / slots * Decimal::from(mode.leverage.max(1));
        let confidence = confidence.clamp(Decimal::ZERO, Decimal::ONE);
        let confidence_factor = dec!(0.5) + dec!(0.7) * confidence;

        let mut notional = mode.base_position_usd.min(slot)
            * self.risk_level.multiplier()
            * confidence_factor;
        notional = notional.clamp(mode.min_position_usd, mode.max_position_usd.max(mode.min_position_usd));
        if let Some(hint) = size_hint.filter(|h| *h > Decimal::ZERO) {
            notional = notional.min(hint);
        }
        notional = notional.round_dp(2);

        if notional < self.entry.min_order_usd {
            return Err(RejectReason::SizeTooSmall {
                notional,
                minimum: self.entry.min_order_usd,
            });
        }
        Ok(notional)
    }
}
