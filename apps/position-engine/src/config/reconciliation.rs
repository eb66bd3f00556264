//! Reconciliation and orphan sweep settings.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::TradingMode;

/// How reconciliation treats a position the guardian is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Apply corrections under the lock regardless of protection state.
    #[default]
    LastWriteWins,
    /// Skip quantity corrections while a placement or heal is in flight.
    DeferToGuardian,
}

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Reconciliation enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative quantity drift ignored, in percent.
    #[serde(default = "default_qty_tolerance_pct")]
    pub qty_tolerance_pct: Decimal,
    /// Shrunk positions below this share of the original are treated as closed.
    #[serde(default = "default_remove_below_original_pct")]
    pub remove_below_original_pct: Decimal,
    /// Concurrent-access arbitration.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Mode order tried when adopting an untracked exchange position.
    #[serde(default = "default_adoption_preference")]
    pub adoption_preference: Vec<TradingMode>,
    /// Fills fetched when recovering an external close.
    #[serde(default = "default_fills_lookback")]
    pub fills_lookback: usize,
    /// Orphan sweep period.
    #[serde(default = "default_orphan_sweep_interval_secs")]
    pub orphan_sweep_interval_secs: u64,
    /// Protective orders per position above which all are cancelled and rebuilt.
    #[serde(default = "default_max_orders_per_position")]
    pub max_orders_per_position: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            qty_tolerance_pct: default_qty_tolerance_pct(),
            remove_below_original_pct: default_remove_below_original_pct(),
            conflict_policy: ConflictPolicy::default(),
            adoption_preference: default_adoption_preference(),
            fills_lookback: default_fills_lookback(),
            orphan_sweep_interval_secs: default_orphan_sweep_interval_secs(),
            max_orders_per_position: default_max_orders_per_position(),
        }
    }
}

impl ReconciliationConfig {
    /// Orphan sweep period.
    #[must_use]
    pub const fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }
}

const fn default_true() -> bool {
    true
}

fn default_qty_tolerance_pct() -> Decimal {
    dec!(1)
}

fn default_remove_below_original_pct() -> Decimal {
    dec!(1)
}

fn default_adoption_preference() -> Vec<TradingMode> {
    vec![
        TradingMode::Swing,
        TradingMode::Scalp,
        TradingMode::Position,
        TradingMode::UltraFast,
    ]
}

const fn default_fills_lookback() -> usize {
    50
}

const fn default_orphan_sweep_interval_secs() -> u64 {
    300
}

const fn default_max_orders_per_position() -> usize {
    4
}
