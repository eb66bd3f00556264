//! Initial stop and take-profit ladder construction.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::ModeConfig;
use crate::domain::{InstrumentRules, Side, TakeProfitLevel};

/// Mode-default stop for an entry, rounded in the protective direction.
#[must_use]
pub fn default_stop(side: Side, entry: Decimal, mode: &ModeConfig, rules: &InstrumentRules) -> Decimal {
    rules.round_stop(side.adverse(entry, mode.stop_loss_pct), side)
}

/// Suggested stop when it sits on the losing side of entry, the mode default otherwise.
#[must_use]
pub fn resolve_stop(
    side: Side,
    entry: Decimal,
    suggested: Option<Decimal>,
    mode: &ModeConfig,
    rules: &InstrumentRules,
) -> Decimal {
    match suggested {
        Some(stop) if stop > Decimal::ZERO && side.is_tighter_stop(entry, stop) => {
            rules.round_stop(stop, side)
        }
        _ => default_stop(side, entry, mode, rules),
    }
}

/// Build the take-profit ladder for an entry.
///
/// Suggested targets on the winning side of entry replace the mode's gains.
/// They keep the mode's close percentages when the counts match and split
/// evenly otherwise, with the last level absorbing the rounding remainder.
#[must_use]
pub fn build_ladder(
    side: Side,
    entry: Decimal,
    mode: &ModeConfig,
    rules: &InstrumentRules,
    suggested: &[Decimal],
) -> Vec<TakeProfitLevel> {
    let mut targets: Vec<Decimal> = suggested
        .iter()
        .copied()
        .filter(|t| side.is_tighter_stop(*t, entry))
        .collect();

    if targets.is_empty() {
        return mode
            .take_profits
            .iter()
            .map(|level| {
                let price = rules.round_target(side.favorable(entry, level.gain_pct), side);
                TakeProfitLevel::pending(price, level.close_pct, level.gain_pct)
            })
            .collect();
    }

    targets.sort_by_key(|t| (*t - entry).abs());
    targets.dedup();

    let close_pcts: Vec<Decimal> = if targets.len() == mode.take_profits.len() {
        mode.take_profits.iter().map(|l| l.close_pct).collect()
    } else {
        even_split(targets.len())
    };

    targets
        .into_iter()
        .zip(close_pcts)
        .map(|(target, close_pct)| {
            let price = rules.round_target(target, side);
            let gain_pct = ((price - entry) / entry * dec!(100) * side.sign()).round_dp(4);
            TakeProfitLevel::pending(price, close_pct, gain_pct)
        })
        .collect()
}

fn even_split(n: usize) -> Vec<Decimal> {
    let count = Decimal::from(n);
    let share = (dec!(100) / count).round_dp_with_strategy(2, rust_decimal::RoundingStrategy::ToZero);
    let mut split = vec![share; n];
    if let Some(last) = split.last_mut() {
        *last = dec!(100) - share * (count - Decimal::ONE);
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TradingMode;

    fn swing() -> ModeConfig {
        ModeConfig::for_mode(TradingMode::Swing)
    }

    #[test]
    fn default_ladder_follows_mode_gains() {
        let ladder = build_ladder(Side::Long, dec!(100), &swing(), &InstrumentRules::default(), &[]);
        let prices: Vec<_> = ladder.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(103), dec!(106), dec!(110), dec!(115)]);
        assert!(ladder.iter().all(|l| l.close_pct == dec!(25)));
    }

    #[test]
    fn short_ladder_descends() {
        let ladder = build_ladder(Side::Short, dec!(100), &swing(), &InstrumentRules::default(), &[]);
        assert_eq!(ladder[0].price, dec!(97));
        assert_eq!(ladder[3].price, dec!(85));
    }

    #[test]
    fn suggested_targets_split_evenly_when_count_differs() {
        let ladder = build_ladder(
            Side::Long,
            dec!(100),
            &swing(),
            &InstrumentRules::default(),
            &[dec!(106), dec!(102), dec!(104)],
        );
        let prices: Vec<_> = ladder.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(102), dec!(104), dec!(106)]);
        let total: Decimal = ladder.iter().map(|l| l.close_pct).sum();
        assert_eq!(total, dec!(100));
        assert_eq!(ladder[0].close_pct, dec!(33.33));
        assert_eq!(ladder[0].gain_pct, dec!(2));
    }

    #[test]
    fn targets_on_the_losing_side_are_ignored() {
        let ladder = build_ladder(
            Side::Long,
            dec!(100),
            &swing(),
            &InstrumentRules::default(),
            &[dec!(95)],
        );
        assert_eq!(ladder.len(), 4);
        assert_eq!(ladder[0].price, dec!(103));
    }

    #[test]
    fn stop_on_the_wrong_side_falls_back_to_default() {
        let rules = InstrumentRules::default();
        assert_eq!(resolve_stop(Side::Long, dec!(100), Some(dec!(101)), &swing(), &rules), dec!(98));
        assert_eq!(resolve_stop(Side::Long, dec!(100), Some(dec!(97.5)), &swing(), &rules), dec!(97.5));
        assert_eq!(resolve_stop(Side::Short, dec!(100), None, &swing(), &rules), dec!(102));
    }
}
