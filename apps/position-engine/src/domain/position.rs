//! Position aggregate.
//!
//! A `Position` is the engine's belief about one open exchange position. The
//! fields that carry invariants (remaining quantity, stop price, closing
//! guard) are private and only change through methods that keep
//! `0 <= remaining <= original` and a monotonically tightening stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::mode::TradingMode;
use super::protection::ProtectionStatus;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    /// Profits when price rises.
    Long,
    /// Profits when price falls.
    Short,
}

/// Exchange order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl Side {
    /// +1 for LONG, -1 for SHORT.
    #[must_use]
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens or adds to this position.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position.
    #[must_use]
    pub const fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// Whether `candidate` is a tighter (more protective) stop than `current`.
    #[must_use]
    pub fn is_tighter_stop(self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// Offset `price` by `pct` percent in the favorable direction.
    #[must_use]
    pub fn favorable(self, price: Decimal, pct: Decimal) -> Decimal {
        price * (Decimal::ONE + self.sign() * pct / dec!(100))
    }

    /// Offset `price` by `pct` percent in the adverse direction.
    #[must_use]
    pub fn adverse(self, price: Decimal, pct: Decimal) -> Decimal {
        price * (Decimal::ONE - self.sign() * pct / dec!(100))
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Take-profit level status. One-directional: `Pending → Hit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelStatus {
    /// Waiting for price.
    Pending,
    /// Executed.
    Hit,
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Trigger price.
    pub price: Decimal,
    /// Percentage of the original quantity this level closes.
    pub close_pct: Decimal,
    /// Price gain from entry, in percent.
    pub gain_pct: Decimal,
    /// Level status.
    pub status: LevelStatus,
}

impl TakeProfitLevel {
    /// New pending level.
    #[must_use]
    pub const fn pending(price: Decimal, close_pct: Decimal, gain_pct: Decimal) -> Self {
        Self {
            price,
            close_pct,
            gain_pct,
            status: LevelStatus::Pending,
        }
    }

    /// Whether this level has executed.
    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.status == LevelStatus::Hit
    }
}

/// Where a position came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Opened from an upstream trade proposal.
    Signal,
    /// Opened by a named strategy.
    Strategy {
        /// Strategy identifier.
        strategy_id: String,
    },
    /// Discovered on the exchange by reconciliation.
    Reconciled,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Strategy { strategy_id } => write!(f, "strategy:{strategy_id}"),
            Self::Reconciled => write!(f, "reconciled"),
        }
    }
}

/// One fill in a progressive (staged) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFill {
    /// Filled quantity.
    pub quantity: Decimal,
    /// Fill price.
    pub price: Decimal,
}

/// Progressive multi-fill averaging sub-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Quantity the staged entry is building toward.
    pub target_qty: Decimal,
    /// Fills so far.
    pub fills: Vec<StagedFill>,
}

impl StagedEntry {
    /// Start a staged entry from its first fill.
    #[must_use]
    pub fn new(target_qty: Decimal, first_qty: Decimal, first_price: Decimal) -> Self {
        Self {
            target_qty,
            fills: vec![StagedFill {
                quantity: first_qty,
                price: first_price,
            }],
        }
    }

    /// Append a fill.
    pub fn record_fill(&mut self, quantity: Decimal, price: Decimal) {
        self.fills.push(StagedFill { quantity, price });
    }

    /// Completed stages.
    #[must_use]
    pub fn stage(&self) -> usize {
        self.fills.len()
    }

    /// Sum of filled quantity.
    #[must_use]
    pub fn filled_qty(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Volume-weighted average fill price.
    #[must_use]
    pub fn average_price(&self) -> Option<Decimal> {
        let qty = self.filled_qty();
        if qty.is_zero() {
            return None;
        }
        let notional: Decimal = self.fills.iter().map(|f| f.quantity * f.price).sum();
        Some(notional / qty)
    }

    /// Whether the target quantity has been reached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled_qty() >= self.target_qty
    }
}

/// Trailing stop parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingParams {
    /// Trailing enabled for this position.
    pub enabled: bool,
    /// Distance from the watermark, in percent.
    pub trail_pct: Decimal,
    /// Independent profit threshold (percent) that arms trailing.
    pub activation_pct: Option<Decimal>,
    /// Arm trailing once a TP has hit and breakeven is applied.
    pub activate_after_breakeven: bool,
    /// Minimum stop improvement (percent) before a ratchet is applied.
    pub min_update_pct: Decimal,
}

impl TrailingParams {
    /// Trailing switched off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            trail_pct: Decimal::ZERO,
            activation_pct: None,
            activate_after_breakeven: false,
            min_update_pct: Decimal::ZERO,
        }
    }
}

/// Everything needed to create a position from a confirmed fill.
#[derive(Debug, Clone)]
pub struct NewPosition {
    /// Instrument symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Trading mode.
    pub mode: TradingMode,
    /// Average fill price.
    pub entry_price: Decimal,
    /// Filled quantity.
    pub quantity: Decimal,
    /// Leverage.
    pub leverage: u32,
    /// Initial stop price.
    pub stop_price: Decimal,
    /// Take-profit ladder.
    pub take_profits: Vec<TakeProfitLevel>,
    /// Trailing parameters.
    pub trailing: TrailingParams,
    /// Where the position came from.
    pub provenance: Provenance,
    /// Optional leveraged-ROI threshold that books the whole position.
    pub custom_roi_target_pct: Option<Decimal>,
    /// Fee paid on entry.
    pub entry_fee: Decimal,
}

/// An open exchange position tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol (registry key).
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Trading mode.
    pub mode: TradingMode,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Quantity at entry (or after an adopted external addition).
    pub original_qty: Decimal,
    remaining_qty: Decimal,
    /// Leverage.
    pub leverage: u32,
    /// Take-profit ladder, ordered by distance from entry.
    pub take_profits: Vec<TakeProfitLevel>,
    stop_price: Decimal,
    /// Stop price at entry or last explicit reset.
    pub original_stop: Decimal,
    /// Breakeven applied (at most once).
    pub breakeven_applied: bool,
    /// Trailing parameters.
    pub trailing: TrailingParams,
    /// Trailing armed.
    pub trailing_active: bool,
    /// Best price seen since entry (high for LONG, low for SHORT).
    pub watermark: Decimal,
    /// Live stop order on the exchange.
    pub stop_order_id: Option<String>,
    /// Live take-profit order on the exchange.
    pub target_order_id: Option<String>,
    /// PnL realized by partial closes, net of fees.
    pub realized_pnl: Decimal,
    /// Last computed unrealized PnL.
    pub unrealized_pnl: Decimal,
    /// Fee paid on entry.
    pub entry_fee: Decimal,
    /// Entry time.
    pub opened_at: DateTime<Utc>,
    /// Where the position came from.
    pub provenance: Provenance,
    closing: bool,
    /// Optional leveraged-ROI threshold that books the whole position.
    pub custom_roi_target_pct: Option<Decimal>,
    /// Progressive entry sub-state.
    pub staged: Option<StagedEntry>,
    /// Protection verification state.
    pub protection: ProtectionStatus,
}

impl Position {
    /// Create a position from a confirmed fill.
    #[must_use]
    pub fn open(new: NewPosition, now: DateTime<Utc>) -> Self {
        Self {
            symbol: new.symbol,
            side: new.side,
            mode: new.mode,
            entry_price: new.entry_price,
            original_qty: new.quantity,
            remaining_qty: new.quantity,
            leverage: new.leverage.max(1),
            take_profits: new.take_profits,
            stop_price: new.stop_price,
            original_stop: new.stop_price,
            breakeven_applied: false,
            trailing: new.trailing,
            trailing_active: false,
            watermark: new.entry_price,
            stop_order_id: None,
            target_order_id: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            entry_fee: new.entry_fee,
            opened_at: now,
            provenance: new.provenance,
            closing: false,
            custom_roi_target_pct: new.custom_roi_target_pct,
            staged: None,
            protection: ProtectionStatus::new(now),
        }
    }

    /// Quantity still open.
    #[must_use]
    pub const fn remaining_qty(&self) -> Decimal {
        self.remaining_qty
    }

    /// Current stop price.
    #[must_use]
    pub const fn stop_price(&self) -> Decimal {
        self.stop_price
    }

    /// An exit is in flight.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.closing
    }

    /// Set the closing guard. Returns `false` if it was already set.
    pub const fn begin_close(&mut self) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        true
    }

    /// Clear the closing guard after an exit attempt that left the position open.
    pub const fn end_close(&mut self) {
        self.closing = false;
    }

    /// Reduce the remaining quantity, clamped at zero. Returns the amount removed.
    pub fn reduce_quantity(&mut self, qty: Decimal) -> Decimal {
        let removed = qty.max(Decimal::ZERO).min(self.remaining_qty);
        self.remaining_qty -= removed;
        removed
    }

    /// Replace the remaining quantity with an externally observed smaller one.
    pub fn shrink_to(&mut self, qty: Decimal) {
        self.remaining_qty = qty.max(Decimal::ZERO).min(self.remaining_qty);
    }

    /// Adopt an externally grown quantity and the exchange's average entry.
    pub fn adopt_quantity(&mut self, qty: Decimal, entry_price: Decimal) {
        let added = qty - self.remaining_qty;
        if added <= Decimal::ZERO {
            return;
        }
        if let Some(staged) = self.staged.as_mut() {
            staged.record_fill(added, entry_price);
        }
        self.original_qty += added;
        self.remaining_qty = qty;
        if entry_price > Decimal::ZERO {
            self.entry_price = entry_price;
        }
    }

    /// Move the stop only if the candidate is more protective.
    pub fn tighten_stop(&mut self, candidate: Decimal) -> bool {
        if self.side.is_tighter_stop(candidate, self.stop_price) {
            self.stop_price = candidate;
            return true;
        }
        false
    }

    /// The breakeven price: entry plus/minus a fee-covering buffer.
    #[must_use]
    pub fn breakeven_price(&self, buffer_pct: Decimal) -> Decimal {
        self.side.favorable(self.entry_price, buffer_pct)
    }

    /// Apply breakeven once. The stop moves only if breakeven is tighter than
    /// the current stop. Returns the new stop when it moved.
    pub fn apply_breakeven(&mut self, breakeven: Decimal) -> Option<Decimal> {
        if self.breakeven_applied {
            return None;
        }
        self.breakeven_applied = true;
        self.tighten_stop(breakeven).then_some(self.stop_price)
    }

    /// Explicit stop/target reset. The only path allowed to loosen the stop.
    pub fn reset_protection(&mut self, stop: Decimal, take_profits: Vec<TakeProfitLevel>) {
        self.stop_price = stop;
        self.original_stop = stop;
        self.take_profits = take_profits;
        self.breakeven_applied = false;
        self.trailing_active = false;
        self.watermark = self.entry_price;
    }

    /// Update the best price seen. Returns `true` when it moved.
    pub fn update_watermark(&mut self, price: Decimal) -> bool {
        let better = match self.side {
            Side::Long => price > self.watermark,
            Side::Short => price < self.watermark,
        };
        if better {
            self.watermark = price;
        }
        better
    }

    /// Favorable price move from entry, in percent (unleveraged).
    #[must_use]
    pub fn pnl_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * dec!(100) * self.side.sign()
    }

    /// Leveraged return on margin, in percent.
    #[must_use]
    pub fn roi_pct(&self, price: Decimal) -> Decimal {
        self.pnl_pct(price) * Decimal::from(self.leverage)
    }

    /// Gross unrealized PnL of the remaining quantity at `price`.
    #[must_use]
    pub fn unrealized_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.remaining_qty * self.side.sign()
    }

    /// Entry notional of the remaining quantity.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.remaining_qty
    }

    /// Margin held by the remaining quantity.
    #[must_use]
    pub fn margin(&self) -> Decimal {
        self.notional() / Decimal::from(self.leverage)
    }

    /// Margin committed at entry.
    #[must_use]
    pub fn initial_margin(&self) -> Decimal {
        self.entry_price * self.original_qty / Decimal::from(self.leverage)
    }

    /// Index of the first pending take-profit level.
    #[must_use]
    pub fn next_pending_level(&self) -> Option<usize> {
        self.take_profits.iter().position(|l| !l.is_hit())
    }

    /// Number of levels already hit.
    #[must_use]
    pub fn levels_hit(&self) -> usize {
        self.take_profits.iter().filter(|l| l.is_hit()).count()
    }

    /// Whether `index` is the last level still pending.
    #[must_use]
    pub fn is_last_pending(&self, index: usize) -> bool {
        self.take_profits
            .iter()
            .enumerate()
            .all(|(i, l)| i == index || l.is_hit())
    }

    /// Mark a level hit. Never reverts. Returns `false` if already hit.
    pub fn mark_level_hit(&mut self, index: usize) -> bool {
        match self.take_profits.get_mut(index) {
            Some(level) if !level.is_hit() => {
                level.status = LevelStatus::Hit;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(side: Side) -> Position {
        let (stop, targets) = match side {
            Side::Long => (dec!(98), [dec!(102), dec!(104), dec!(106)]),
            Side::Short => (dec!(102), [dec!(98), dec!(96), dec!(94)]),
        };
        Position::open(
            NewPosition {
                symbol: "BTCUSDT".to_string(),
                side,
                mode: TradingMode::Swing,
                entry_price: dec!(100),
                quantity: dec!(10),
                leverage: 10,
                stop_price: stop,
                take_profits: vec![
                    TakeProfitLevel::pending(targets[0], dec!(40), dec!(2)),
                    TakeProfitLevel::pending(targets[1], dec!(30), dec!(4)),
                    TakeProfitLevel::pending(targets[2], dec!(30), dec!(6)),
                ],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        )
    }

    #[test]
    fn long_stop_only_tightens_upward() {
        let mut p = sample(Side::Long);
        assert!(!p.tighten_stop(dec!(97)));
        assert!(p.tighten_stop(dec!(99)));
        assert_eq!(p.stop_price(), dec!(99));
    }

    #[test]
    fn short_stop_only_tightens_downward() {
        let mut p = sample(Side::Short);
        assert!(!p.tighten_stop(dec!(103)));
        assert!(p.tighten_stop(dec!(101)));
        assert_eq!(p.stop_price(), dec!(101));
    }

    #[test]
    fn breakeven_applies_once() {
        let mut p = sample(Side::Long);
        let be = p.breakeven_price(dec!(0.1));
        assert_eq!(be, dec!(100.1));
        assert_eq!(p.apply_breakeven(be), Some(dec!(100.1)));
        assert_eq!(p.apply_breakeven(dec!(100.5)), None);
        assert_eq!(p.stop_price(), dec!(100.1));
    }

    #[test]
    fn breakeven_never_loosens_a_trailed_stop() {
        let mut p = sample(Side::Long);
        p.tighten_stop(dec!(101));
        assert_eq!(p.apply_breakeven(dec!(100.1)), None);
        assert!(p.breakeven_applied);
        assert_eq!(p.stop_price(), dec!(101));
    }

    #[test]
    fn short_breakeven_sits_below_entry() {
        let p = sample(Side::Short);
        assert_eq!(p.breakeven_price(dec!(0.1)), dec!(99.9));
    }

    #[test]
    fn reset_can_loosen_the_stop() {
        let mut p = sample(Side::Long);
        p.tighten_stop(dec!(99.5));
        p.reset_protection(dec!(95), vec![]);
        assert_eq!(p.stop_price(), dec!(95));
        assert_eq!(p.original_stop, dec!(95));
    }

    #[test]
    fn closing_guard_is_exclusive() {
        let mut p = sample(Side::Long);
        assert!(p.begin_close());
        assert!(!p.begin_close());
        p.end_close();
        assert!(p.begin_close());
    }

    #[test]
    fn adopt_grows_original_and_records_stage() {
        let mut p = sample(Side::Long);
        p.staged = Some(StagedEntry::new(dec!(20), dec!(10), dec!(100)));
        p.adopt_quantity(dec!(15), dec!(101));
        assert_eq!(p.remaining_qty(), dec!(15));
        assert_eq!(p.original_qty, dec!(15));
        assert_eq!(p.entry_price, dec!(101));
        assert_eq!(p.staged.as_ref().unwrap().stage(), 2);
    }

    #[test]
    fn staged_average_is_volume_weighted() {
        let mut staged = StagedEntry::new(dec!(3), dec!(1), dec!(100));
        staged.record_fill(dec!(2), dec!(103));
        assert_eq!(staged.average_price(), Some(dec!(102)));
        assert!(staged.is_complete());
    }

    #[test]
    fn roi_is_leveraged_pnl() {
        let p = sample(Side::Short);
        assert_eq!(p.pnl_pct(dec!(98)), dec!(2));
        assert_eq!(p.roi_pct(dec!(98)), dec!(20));
        assert_eq!(p.margin(), dec!(100));
    }

    #[test]
    fn levels_never_revert() {
        let mut p = sample(Side::Long);
        assert!(p.mark_level_hit(0));
        assert!(!p.mark_level_hit(0));
        assert_eq!(p.next_pending_level(), Some(1));
        assert!(!p.is_last_pending(1));
        p.mark_level_hit(1);
        assert!(p.is_last_pending(2));
    }

    proptest! {
        #[test]
        fn remaining_stays_within_bounds(ops in proptest::collection::vec((0u8..3, 0i64..2000), 1..40)) {
            let mut p = sample(Side::Long);
            for (op, raw) in ops {
                let qty = Decimal::new(raw, 2);
                match op {
                    0 => { p.reduce_quantity(qty); }
                    1 => p.shrink_to(qty),
                    _ => p.adopt_quantity(qty, dec!(100)),
                }
                prop_assert!(p.remaining_qty() >= Decimal::ZERO);
                prop_assert!(p.remaining_qty() <= p.original_qty);
            }
        }

        #[test]
        fn stop_is_monotonic(candidates in proptest::collection::vec(9000i64..11000, 1..50)) {
            let mut p = sample(Side::Long);
            let mut last = p.stop_price();
            for raw in candidates {
                p.tighten_stop(Decimal::new(raw, 2));
                if raw % 7 == 0 {
                    p.apply_breakeven(p.breakeven_price(dec!(0.1)));
                }
                prop_assert!(p.stop_price() >= last);
                last = p.stop_price();
            }
        }
    }
}
