//! Per-mode capital allocation.
//!
//! Each base mode owns `allocation_pct` of the account balance. Margin is
//! `notional / leverage`, and the bucket's margin budget is the allocated
//! capital divided by the mode's leverage. An entry is admitted while
//!
//! ```text
//! used_margin + reserved_margin + requested_margin <= budget * OVER_ALLOCATION_TOLERANCE
//! ```
//!
//! The tolerance absorbs balance movement from unrealized PnL. Reservations
//! cover entries between the gate check and the registry insert; they are
//! RAII guards and release on drop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::ModesConfig;
use crate::domain::TradingMode;
use crate::registry::PositionRegistry;

/// Headroom multiplier applied to every bucket's budget.
pub const OVER_ALLOCATION_TOLERANCE: Decimal = dec!(1.05);

/// Why an allocation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationDenied {
    /// The bucket has no capital.
    NoAllocation {
        /// Bucket.
        mode: TradingMode,
    },
    /// The bucket is at its position count.
    MaxPositions {
        /// Bucket.
        mode: TradingMode,
        /// Limit.
        max: usize,
    },
    /// The requested size exceeds the per-position maximum.
    PositionTooLarge {
        /// Requested notional.
        notional: Decimal,
        /// Maximum notional.
        max: Decimal,
    },
    /// The bucket's margin budget would be exceeded.
    BudgetExceeded {
        /// Bucket.
        mode: TradingMode,
        /// Margin already committed (open + reserved).
        used: Decimal,
        /// Margin requested.
        requested: Decimal,
        /// Budget before tolerance.
        budget: Decimal,
    },
}

impl std::fmt::Display for AllocationDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAllocation { mode } => write!(f, "{mode} has no capital allocation"),
            Self::MaxPositions { mode, max } => write!(f, "{mode} already holds {max} positions"),
            Self::PositionTooLarge { notional, max } => {
                write!(f, "notional {notional} exceeds max position size {max}")
            }
            Self::BudgetExceeded {
                mode,
                used,
                requested,
                budget,
            } => write!(
                f,
                "{mode} margin {used} + {requested} exceeds budget {budget}"
            ),
        }
    }
}

/// Allocation view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationStatus {
    /// Base mode.
    pub mode: TradingMode,
    /// Margin budget before tolerance.
    pub budget: Decimal,
    /// Margin held by open positions.
    pub used: Decimal,
    /// Margin held by in-flight entries.
    pub reserved: Decimal,
    /// Open positions.
    pub positions: usize,
    /// Position limit.
    pub max_positions: usize,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    mode: TradingMode,
    margin: Decimal,
}

/// Capital allocator shared by every entry path.
#[derive(Debug)]
pub struct CapitalAllocator {
    modes: ModesConfig,
    registry: Arc<PositionRegistry>,
    reservations: Mutex<HashMap<String, Reservation>>,
}

impl CapitalAllocator {
    /// Create an allocator over `registry`.
    #[must_use]
    pub fn new(modes: ModesConfig, registry: Arc<PositionRegistry>) -> Self {
        Self {
            modes,
            registry,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Margin budget for the bucket `mode` belongs to.
    #[must_use]
    pub fn budget(&self, mode: TradingMode, balance: Decimal) -> Decimal {
        let bucket = self.modes.bucket(mode);
        let capital = balance * bucket.allocation_pct / dec!(100);
        capital / Decimal::from(bucket.leverage.max(1))
    }

    fn check_locked(
        &self,
        reservations: &HashMap<String, Reservation>,
        mode: TradingMode,
        notional: Decimal,
        leverage: u32,
        balance: Decimal,
    ) -> Result<Decimal, AllocationDenied> {
        let base = mode.base_mode();
        let bucket = self.modes.bucket(mode);
        if bucket.allocation_pct <= Decimal::ZERO {
            return Err(AllocationDenied::NoAllocation { mode: base });
        }
        if notional > self.modes.get(mode).max_position_usd {
            return Err(AllocationDenied::PositionTooLarge {
                notional,
                max: self.modes.get(mode).max_position_usd,
            });
        }

        let usage = self.registry.usage_for(mode);
        let (reserved_count, reserved_margin) = reservations
            .values()
            .filter(|r| r.mode == base)
            .fold((0usize, Decimal::ZERO), |(n, m), r| (n + 1, m + r.margin));

        if usage.positions + reserved_count >= bucket.max_positions {
            return Err(AllocationDenied::MaxPositions {
                mode: base,
                max: bucket.max_positions,
            });
        }

        let requested = notional / Decimal::from(leverage.max(1));
        let used = usage.margin + reserved_margin;
        let budget = self.budget(mode, balance);
        if used + requested > budget * OVER_ALLOCATION_TOLERANCE {
            return Err(AllocationDenied::BudgetExceeded {
                mode: base,
                used,
                requested,
                budget,
            });
        }
        Ok(requested)
    }

    /// Check headroom without reserving.
    pub fn check(
        &self,
        mode: TradingMode,
        notional: Decimal,
        leverage: u32,
        balance: Decimal,
    ) -> Result<(), AllocationDenied> {
        let reservations = self.reservations.lock();
        self.check_locked(&reservations, mode, notional, leverage, balance)
            .map(|_| ())
    }

    /// Check headroom and hold the margin for `symbol` until the returned
    /// guard drops.
    pub fn try_reserve(
        self: &Arc<Self>,
        symbol: &str,
        mode: TradingMode,
        notional: Decimal,
        leverage: u32,
        balance: Decimal,
    ) -> Result<AllocationReservation, AllocationDenied> {
        let mut reservations = self.reservations.lock();
        let margin = self.check_locked(&reservations, mode, notional, leverage, balance)?;
        reservations.insert(
            symbol.to_string(),
            Reservation {
                mode: mode.base_mode(),
                margin,
            },
        );
        Ok(AllocationReservation {
            allocator: Arc::clone(self),
            symbol: symbol.to_string(),
            margin,
        })
    }

    fn release(&self, symbol: &str) {
        self.reservations.lock().remove(symbol);
    }

    /// Allocation view of every base mode.
    #[must_use]
    pub fn status(&self, balance: Decimal) -> Vec<AllocationStatus> {
        let usage = self.registry.usage_by_mode();
        let reservations = self.reservations.lock();
        TradingMode::base_modes()
            .map(|mode| {
                let used = usage.get(&mode).copied().unwrap_or_default();
                AllocationStatus {
                    mode,
                    budget: self.budget(mode, balance),
                    used: used.margin,
                    reserved: reservations
                        .values()
                        .filter(|r| r.mode == mode)
                        .map(|r| r.margin)
                        .sum(),
                    positions: used.positions,
                    max_positions: self.modes.get(mode).max_positions,
                }
            })
            .collect()
    }
}

/// Margin held for an entry in flight.
#[derive(Debug)]
pub struct AllocationReservation {
    allocator: Arc<CapitalAllocator>,
    symbol: String,
    margin: Decimal,
}

impl AllocationReservation {
    /// Reserved margin.
    #[must_use]
    pub const fn margin(&self) -> Decimal {
        self.margin
    }
}

impl Drop for AllocationReservation {
    fn drop(&mut self) {
        self.allocator.release(&self.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewPosition, Position, Provenance, Side, TrailingParams};
    use chrono::Utc;

    fn modes() -> ModesConfig {
        let mut modes = ModesConfig::default();
        let scalp = modes.get_mut(TradingMode::Scalp);
        scalp.allocation_pct = dec!(10);
        scalp.leverage = 10;
        scalp.max_positions = 3;
        scalp.max_position_usd = dec!(1000);
        modes
    }

    fn open(registry: &PositionRegistry, symbol: &str, mode: TradingMode, notional: Decimal) {
        registry.insert_if_absent(Position::open(
            NewPosition {
                symbol: symbol.to_string(),
                side: Side::Long,
                mode,
                entry_price: dec!(100),
                quantity: notional / dec!(100),
                leverage: 10,
                stop_price: dec!(99),
                take_profits: vec![],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        ));
    }

    #[test]
    fn second_large_position_exceeds_margin_budget() {
        // 10% of 10_000 = 1_000 capital at 10x = 100 margin budget.
        let registry = Arc::new(PositionRegistry::new());
        let allocator = Arc::new(CapitalAllocator::new(modes(), Arc::clone(&registry)));
        assert_eq!(allocator.budget(TradingMode::Scalp, dec!(10000)), dec!(100));

        let first = allocator
            .try_reserve("BTCUSDT", TradingMode::Scalp, dec!(600), 10, dec!(10000))
            .unwrap();
        assert_eq!(first.margin(), dec!(60));

        let second =
            allocator.try_reserve("ETHUSDT", TradingMode::Scalp, dec!(600), 10, dec!(10000));
        assert!(matches!(
            second,
            Err(AllocationDenied::BudgetExceeded { used, requested, .. })
                if used == dec!(60) && requested == dec!(60)
        ));
    }

    #[test]
    fn reservations_release_on_drop() {
        let registry = Arc::new(PositionRegistry::new());
        let allocator = Arc::new(CapitalAllocator::new(modes(), Arc::clone(&registry)));
        {
            let _held = allocator
                .try_reserve("BTCUSDT", TradingMode::Scalp, dec!(600), 10, dec!(10000))
                .unwrap();
            assert!(allocator.check(TradingMode::Scalp, dec!(600), 10, dec!(10000)).is_err());
        }
        assert!(allocator.check(TradingMode::Scalp, dec!(600), 10, dec!(10000)).is_ok());
    }

    #[test]
    fn open_positions_count_against_the_shared_bucket() {
        let registry = Arc::new(PositionRegistry::new());
        open(&registry, "BTCUSDT", TradingMode::Scalp, dec!(300));
        open(&registry, "ETHUSDT", TradingMode::ScalpReentry, dec!(300));
        let allocator = CapitalAllocator::new(modes(), Arc::clone(&registry));

        // 60 used, 45 more would hit 105 exactly.
        assert!(allocator.check(TradingMode::Scalp, dec!(450), 10, dec!(10000)).is_ok());
        assert!(allocator.check(TradingMode::ScalpReentry, dec!(460), 10, dec!(10000)).is_err());

        open(&registry, "SOLUSDT", TradingMode::Scalp, dec!(10));
        assert_eq!(
            allocator.check(TradingMode::Scalp, dec!(10), 10, dec!(10000)),
            Err(AllocationDenied::MaxPositions {
                mode: TradingMode::Scalp,
                max: 3
            })
        );
    }

    #[test]
    fn per_position_cap_and_zero_allocation() {
        let registry = Arc::new(PositionRegistry::new());
        let mut config = modes();
        config.get_mut(TradingMode::Swing).allocation_pct = Decimal::ZERO;
        let allocator = CapitalAllocator::new(config, registry);
        assert!(matches!(
            allocator.check(TradingMode::Scalp, dec!(1500), 10, dec!(100000)),
            Err(AllocationDenied::PositionTooLarge { .. })
        ));
        assert_eq!(
            allocator.check(TradingMode::Swing, dec!(100), 5, dec!(10000)),
            Err(AllocationDenied::NoAllocation {
                mode: TradingMode::Swing
            })
        );
    }
}
