//! Exchange trading rules for an instrument and the rounding they imply.
//!
//! Stops round in the protective direction (a LONG stop rounds up toward the
//! price, a SHORT stop rounds down) so a rounded stop never protects less than
//! the computed one. Targets round in the favorable direction (a LONG target
//! rounds down, a SHORT target rounds up) so a rounded target never fails to
//! fire where the computed one would. Quantities always floor to the lot step.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::position::Side;

/// Price/quantity granularity and minimums published by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRules {
    /// Price tick size.
    pub tick_size: Decimal,
    /// Quantity lot step.
    pub step_size: Decimal,
    /// Minimum order quantity.
    pub min_qty: Decimal,
    /// Minimum order notional for opening orders.
    pub min_notional: Decimal,
}

impl Default for InstrumentRules {
    fn default() -> Self {
        Self {
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
        }
    }
}

impl InstrumentRules {
    /// Round a stop trigger price in the protective direction.
    #[must_use]
    pub fn round_stop(&self, price: Decimal, side: Side) -> Decimal {
        match side {
            Side::Long => ceil_to(price, self.tick_size),
            Side::Short => floor_to(price, self.tick_size),
        }
    }

    /// Round a take-profit trigger price in the favorable direction.
    #[must_use]
    pub fn round_target(&self, price: Decimal, side: Side) -> Decimal {
        match side {
            Side::Long => floor_to(price, self.tick_size),
            Side::Short => ceil_to(price, self.tick_size),
        }
    }

    /// Round a plain price (limit exits) to the nearest tick.
    #[must_use]
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }

    /// Floor a quantity to the lot step.
    #[must_use]
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        floor_to(qty, self.step_size)
    }

    /// A quantity that cannot form a valid order after rounding.
    #[must_use]
    pub fn is_dust(&self, qty: Decimal) -> bool {
        let rounded = self.round_qty(qty);
        rounded <= Decimal::ZERO || rounded < self.min_qty
    }
}

fn floor_to(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

fn ceil_to(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> InstrumentRules {
        InstrumentRules {
            tick_size: dec!(0.01),
            step_size: dec!(0.01),
            min_qty: dec!(0.01),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn long_stop_rounds_up() {
        assert_eq!(rules().round_stop(dec!(97.991), Side::Long), dec!(98.00));
    }

    #[test]
    fn short_stop_rounds_down() {
        assert_eq!(rules().round_stop(dec!(102.019), Side::Short), dec!(102.01));
    }

    #[test]
    fn long_target_rounds_down() {
        assert_eq!(rules().round_target(dec!(102.019), Side::Long), dec!(102.01));
    }

    #[test]
    fn short_target_rounds_up() {
        assert_eq!(rules().round_target(dec!(97.991), Side::Short), dec!(98.00));
    }

    #[test]
    fn quantity_floors_to_step() {
        assert_eq!(rules().round_qty(dec!(1.239)), dec!(1.23));
    }

    #[test]
    fn rounded_to_zero_is_dust() {
        assert!(rules().is_dust(dec!(0.009)));
        assert!(!rules().is_dust(dec!(0.01)));
    }

    #[test]
    fn zero_step_leaves_value_untouched() {
        let r = InstrumentRules {
            step_size: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            ..rules()
        };
        assert_eq!(r.round_qty(dec!(1.23456)), dec!(1.23456));
        assert_eq!(r.round_stop(dec!(1.23456), Side::Long), dec!(1.23456));
    }
}
