//! TP/SL/Trailing engine.
//!
//! [`evaluate`] runs once per price update against a position held under the
//! registry lock. It mutates only in-memory state (watermark, stop price,
//! trailing flag) and returns the exchange actions the caller must perform
//! after releasing the lock. Take-profit levels are marked hit only once the
//! exchange fill is confirmed, through [`commit_take_profit`].
//!
//! Per tick, in order:
//!
//! 1. max hold elapsed → close
//! 2. stop crossed (with tolerance band) → close
//! 3. trailing pullback from the watermark → close
//! 4. custom ROI target reached → close
//! 5. first pending TP reached → partial close (at most one level per tick)
//! 6. trailing activation, then ratchet
//! 7. proactive breakeven

pub mod ladder;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::ModeConfig;
use crate::domain::{CloseReason, InstrumentRules, Position, Side};

pub use ladder::{build_ladder, default_stop, resolve_stop};

/// Inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Tick<'a> {
    /// Current mark price.
    pub price: Decimal,
    /// Evaluation time.
    pub now: DateTime<Utc>,
    /// The position's mode record.
    pub mode: &'a ModeConfig,
    /// Trigger tolerance band, in percent of the trigger price.
    pub tolerance_pct: Decimal,
    /// Exchange rounding rules.
    pub rules: &'a InstrumentRules,
}

/// Why the stop moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMove {
    /// One-time breakeven transition.
    Breakeven,
    /// Trailing ratchet.
    Trailing,
    /// Accepted advisory update.
    Advisory,
}

impl StopMove {
    /// Metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Breakeven => "breakeven",
            Self::Trailing => "trailing",
            Self::Advisory => "advisory",
        }
    }
}

/// Exchange work requested by an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Close everything that remains.
    Close {
        /// Exit reason.
        reason: CloseReason,
    },
    /// Execute one take-profit level.
    TakeProfit {
        /// Ladder index.
        level: usize,
        /// Quantity to close.
        quantity: Decimal,
        /// Closes the remainder of the position.
        final_level: bool,
    },
    /// The in-memory stop moved; the exchange stop must follow.
    MoveStop {
        /// New stop price.
        price: Decimal,
        /// Cause.
        cause: StopMove,
    },
}

fn band(price: Decimal, tolerance_pct: Decimal) -> Decimal {
    price * tolerance_pct / dec!(100)
}

/// Price has reached `level` in the adverse direction (stop semantics).
fn crossed_stop(side: Side, price: Decimal, stop: Decimal, tolerance_pct: Decimal) -> bool {
    let tol = band(stop, tolerance_pct);
    match side {
        Side::Long => price <= stop + tol,
        Side::Short => price >= stop - tol,
    }
}

/// Price has reached `target` in the favorable direction.
fn reached_target(side: Side, price: Decimal, target: Decimal, tolerance_pct: Decimal) -> bool {
    let tol = band(target, tolerance_pct);
    match side {
        Side::Long => price >= target - tol,
        Side::Short => price <= target + tol,
    }
}

/// Evaluate one price update.
pub fn evaluate(position: &mut Position, tick: &Tick<'_>) -> Vec<TickAction> {
    if position.is_closing() {
        return Vec::new();
    }
    let side = position.side;
    let price = tick.price;

    if let Some(max_hold) = tick.mode.max_hold_secs {
        let held = tick.now - position.opened_at;
        if held.num_seconds() >= i64::try_from(max_hold).unwrap_or(i64::MAX) {
            return vec![TickAction::Close {
                reason: CloseReason::MaxHold,
            }];
        }
    }

    if crossed_stop(side, price, position.stop_price(), tick.tolerance_pct) {
        let reason = if position.trailing_active {
            CloseReason::TrailingStop
        } else {
            CloseReason::StopLoss
        };
        return vec![TickAction::Close { reason }];
    }

    if position.trailing_active
        && position.trailing.trail_pct > Decimal::ZERO
        && !position.watermark.is_zero()
    {
        let pullback_pct =
            (position.watermark - price) / position.watermark * dec!(100) * side.sign();
        if pullback_pct + tick.tolerance_pct >= position.trailing.trail_pct {
            return vec![TickAction::Close {
                reason: CloseReason::TrailingStop,
            }];
        }
    }

    if let Some(target) = position.custom_roi_target_pct
        && position.roi_pct(price) >= target
    {
        return vec![TickAction::Close {
            reason: CloseReason::CustomRoi,
        }];
    }

    position.update_watermark(price);
    position.unrealized_pnl = position.unrealized_at(price);

    if let Some(index) = position.next_pending_level() {
        let level = &position.take_profits[index];
        if reached_target(side, price, level.price, tick.tolerance_pct) {
            return vec![take_profit_action(position, index, tick.rules)];
        }
    }

    let mut actions = Vec::new();

    if position.trailing.enabled && !position.trailing_active {
        let after_breakeven = position.trailing.activate_after_breakeven
            && position.breakeven_applied
            && position.levels_hit() > 0;
        let by_profit = position
            .trailing
            .activation_pct
            .is_some_and(|threshold| position.pnl_pct(price) >= threshold);
        if after_breakeven || by_profit {
            position.trailing_active = true;
            tracing::info!(
                symbol = %position.symbol,
                watermark = %position.watermark,
                after_breakeven,
                "Trailing stop armed"
            );
        }
    }

    if position.trailing_active && position.trailing.trail_pct > Decimal::ZERO {
        let candidate = tick
            .rules
            .round_stop(side.adverse(position.watermark, position.trailing.trail_pct), side);
        let current = position.stop_price();
        if side.is_tighter_stop(candidate, current) && !current.is_zero() {
            let improvement_pct = ((candidate - current) / current * dec!(100)).abs();
            if improvement_pct >= position.trailing.min_update_pct && position.tighten_stop(candidate)
            {
                actions.push(TickAction::MoveStop {
                    price: candidate,
                    cause: StopMove::Trailing,
                });
            }
        }
    }

    if tick.mode.breakeven.enabled
        && !position.breakeven_applied
        && let Some(trigger) = tick.mode.breakeven.proactive_trigger_pct
        && position.pnl_pct(price) >= trigger
    {
        let breakeven = tick
            .rules
            .round_stop(position.breakeven_price(tick.mode.breakeven.buffer_pct), side);
        if let Some(stop) = position.apply_breakeven(breakeven) {
            tracing::info!(symbol = %position.symbol, stop = %stop, "Proactive breakeven applied");
            actions.push(TickAction::MoveStop {
                price: stop,
                cause: StopMove::Breakeven,
            });
        }
    }

    actions
}

/// Size a take-profit at `index`. A partial level that would leave, or itself
/// be, an unplaceable quantity is promoted to a full close.
fn take_profit_action(position: &Position, index: usize, rules: &InstrumentRules) -> TickAction {
    let remaining = position.remaining_qty();
    let full = TickAction::TakeProfit {
        level: index,
        quantity: remaining,
        final_level: true,
    };
    if position.is_last_pending(index) {
        return full;
    }

    let close_pct = position.take_profits[index].close_pct;
    let quantity = rules
        .round_qty(position.original_qty * close_pct / dec!(100))
        .min(remaining);
    if rules.is_dust(quantity) || rules.is_dust(remaining - quantity) {
        return full;
    }
    TickAction::TakeProfit {
        level: index,
        quantity,
        final_level: false,
    }
}

/// Result of committing a partial take-profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeProfitCommit {
    /// Quantity removed from the position.
    pub closed_qty: Decimal,
    /// PnL realized by this close, net of exit fee and entry-fee share.
    pub realized: Decimal,
    /// New stop when breakeven was applied.
    pub breakeven_stop: Option<Decimal>,
}

/// Record a confirmed partial take-profit fill.
pub fn commit_take_profit(
    position: &mut Position,
    level: usize,
    filled_qty: Decimal,
    exit_price: Decimal,
    exit_fee: Decimal,
    mode: &ModeConfig,
    rules: &InstrumentRules,
) -> TakeProfitCommit {
    let original = position.original_qty;
    position.mark_level_hit(level);
    let closed_qty = position.reduce_quantity(filled_qty);

    let entry_fee_share = if original.is_zero() {
        Decimal::ZERO
    } else {
        position.entry_fee * closed_qty / original
    };
    let realized = (exit_price - position.entry_price) * closed_qty * position.side.sign()
        - exit_fee
        - entry_fee_share;
    position.realized_pnl += realized;

    let breakeven_stop = if mode.breakeven.enabled && position.levels_hit() == 1 {
        let breakeven = rules.round_stop(
            position.breakeven_price(mode.breakeven.buffer_pct),
            position.side,
        );
        position.apply_breakeven(breakeven)
    } else {
        None
    };

    TakeProfitCommit {
        closed_qty,
        realized,
        breakeven_stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewPosition, Provenance, TakeProfitLevel, TradingMode, TrailingParams};
    use chrono::Duration;
    use test_case::test_case;

    fn scenario_mode() -> ModeConfig {
        let mut mode = ModeConfig::for_mode(TradingMode::Swing);
        mode.breakeven.proactive_trigger_pct = None;
        mode.trailing.enabled = false;
        mode
    }

    fn position(side: Side) -> Position {
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

    fn tick<'a>(price: Decimal, mode: &'a ModeConfig, rules: &'a InstrumentRules) -> Tick<'a> {
        Tick {
            price,
            now: Utc::now(),
            mode,
            tolerance_pct: dec!(0.01),
            rules,
        }
    }

    #[test_case(Side::Long, dec!(98), true ; "long at stop")]
    #[test_case(Side::Long, dec!(98.005), true ; "long inside tolerance band")]
    #[test_case(Side::Long, dec!(98.5), false ; "long above stop")]
    #[test_case(Side::Short, dec!(102), true ; "short at stop")]
    #[test_case(Side::Short, dec!(101.5), false ; "short below stop")]
    fn stop_trigger(side: Side, price: Decimal, fires: bool) {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(side);
        let actions = evaluate(&mut p, &tick(price, &mode, &rules));
        assert_eq!(
            actions.contains(&TickAction::Close {
                reason: CloseReason::StopLoss
            }),
            fires
        );
    }

    #[test]
    fn first_level_closes_its_share_of_original() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        let actions = evaluate(&mut p, &tick(dec!(102), &mode, &rules));
        assert_eq!(actions, vec![TickAction::TakeProfit {
            level: 0,
            quantity: dec!(4),
            final_level: false
        }]);
        // Not marked until the fill is committed.
        assert_eq!(p.levels_hit(), 0);
    }

    #[test]
    fn only_one_level_per_tick() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        let actions = evaluate(&mut p, &tick(dec!(107), &mode, &rules));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], TickAction::TakeProfit { level: 0, .. }));
    }

    #[test]
    fn last_pending_level_closes_the_remainder() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        p.mark_level_hit(0);
        p.mark_level_hit(1);
        p.reduce_quantity(dec!(7));
        let actions = evaluate(&mut p, &tick(dec!(106), &mode, &rules));
        assert_eq!(actions, vec![TickAction::TakeProfit {
            level: 2,
            quantity: dec!(3),
            final_level: true
        }]);
    }

    #[test]
    fn dust_residual_promotes_to_final_close() {
        let mode = scenario_mode();
        let rules = InstrumentRules {
            step_size: dec!(1),
            min_qty: dec!(1),
            ..InstrumentRules::default()
        };
        let mut p = position(Side::Long);
        p.reduce_quantity(dec!(5.5));
        let actions = evaluate(&mut p, &tick(dec!(102), &mode, &rules));
        assert_eq!(actions, vec![TickAction::TakeProfit {
            level: 0,
            quantity: dec!(4.5),
            final_level: true
        }]);
    }

    #[test]
    fn commit_moves_stop_to_breakeven_on_first_hit() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        let commit = commit_take_profit(&mut p, 0, dec!(4), dec!(102), Decimal::ZERO, &mode, &rules);
        assert_eq!(commit.closed_qty, dec!(4));
        assert_eq!(commit.realized, dec!(8));
        assert_eq!(commit.breakeven_stop, Some(dec!(100.1)));
        assert_eq!(p.remaining_qty(), dec!(6));

        let second = commit_take_profit(&mut p, 1, dec!(3), dec!(104), Decimal::ZERO, &mode, &rules);
        assert_eq!(second.breakeven_stop, None);
        assert_eq!(p.stop_price(), dec!(100.1));
    }

    #[test]
    fn short_breakeven_is_below_entry() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Short);
        let commit = commit_take_profit(&mut p, 0, dec!(4), dec!(98), Decimal::ZERO, &mode, &rules);
        assert_eq!(commit.breakeven_stop, Some(dec!(99.9)));
    }

    #[test]
    fn profit_threshold_arms_trailing_before_tp1() {
        let mut mode = scenario_mode();
        mode.trailing.enabled = true;
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        p.take_profits = vec![TakeProfitLevel::pending(dec!(110), dec!(100), dec!(10))];
        p.trailing = TrailingParams {
            enabled: true,
            trail_pct: dec!(1.5),
            activation_pct: Some(dec!(2)),
            activate_after_breakeven: true,
            min_update_pct: dec!(0.2),
        };

        let actions = evaluate(&mut p, &tick(dec!(105), &mode, &rules));
        assert!(p.trailing_active);
        assert_eq!(p.levels_hit(), 0);
        // 105 * 0.985 = 103.425 rounded up to the tick.
        assert_eq!(actions, vec![TickAction::MoveStop {
            price: dec!(103.43),
            cause: StopMove::Trailing
        }]);
    }

    #[test]
    fn small_ratchets_are_suppressed() {
        let rules = InstrumentRules::default();
        let mode = scenario_mode();
        let mut p = position(Side::Long);
        p.take_profits.clear();
        p.trailing = TrailingParams {
            enabled: true,
            trail_pct: dec!(1),
            activation_pct: Some(dec!(1)),
            activate_after_breakeven: false,
            min_update_pct: dec!(0.5),
        };
        evaluate(&mut p, &tick(dec!(110), &mode, &rules));
        let stop = p.stop_price();
        let actions = evaluate(&mut p, &tick(dec!(110.2), &mode, &rules));
        assert!(actions.is_empty());
        assert_eq!(p.stop_price(), stop);
    }

    #[test]
    fn trailing_pullback_closes() {
        let rules = InstrumentRules::default();
        let mode = scenario_mode();
        let mut p = position(Side::Short);
        p.take_profits.clear();
        p.trailing = TrailingParams {
            enabled: true,
            trail_pct: dec!(1),
            activation_pct: Some(dec!(1)),
            activate_after_breakeven: false,
            min_update_pct: dec!(100),
        };
        evaluate(&mut p, &tick(dec!(90), &mode, &rules));
        assert!(p.trailing_active);
        let actions = evaluate(&mut p, &tick(dec!(91), &mode, &rules));
        assert_eq!(actions, vec![TickAction::Close {
            reason: CloseReason::TrailingStop
        }]);
    }

    #[test]
    fn proactive_breakeven_applies_once() {
        let mut mode = scenario_mode();
        mode.breakeven.proactive_trigger_pct = Some(dec!(1));
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        let first = evaluate(&mut p, &tick(dec!(101.2), &mode, &rules));
        assert_eq!(first, vec![TickAction::MoveStop {
            price: dec!(100.1),
            cause: StopMove::Breakeven
        }]);
        let second = evaluate(&mut p, &tick(dec!(101.5), &mode, &rules));
        assert!(second.is_empty());
    }

    #[test]
    fn max_hold_forces_close() {
        let mut mode = scenario_mode();
        mode.max_hold_secs = Some(60);
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        p.opened_at = Utc::now() - Duration::seconds(61);
        let actions = evaluate(&mut p, &tick(dec!(100.5), &mode, &rules));
        assert_eq!(actions, vec![TickAction::Close {
            reason: CloseReason::MaxHold
        }]);
    }

    #[test]
    fn custom_roi_target_books_everything() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        p.custom_roi_target_pct = Some(dec!(15));
        let actions = evaluate(&mut p, &tick(dec!(101.6), &mode, &rules));
        assert_eq!(actions, vec![TickAction::Close {
            reason: CloseReason::CustomRoi
        }]);
    }

    #[test]
    fn closing_positions_are_left_alone() {
        let mode = scenario_mode();
        let rules = InstrumentRules::default();
        let mut p = position(Side::Long);
        p.begin_close();
        assert!(evaluate(&mut p, &tick(dec!(90), &mode, &rules)).is_empty());
    }
}
