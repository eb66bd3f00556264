//! Per-mode configuration records.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::{TradingMode, TrailingParams};

/// One rung of a configured take-profit ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitLevelConfig {
    /// Price gain from entry, in percent.
    pub gain_pct: Decimal,
    /// Share of the original quantity closed at this level, in percent.
    pub close_pct: Decimal,
}

impl TakeProfitLevelConfig {
    fn ladder(gains: [Decimal; 4]) -> Vec<Self> {
        gains
            .into_iter()
            .map(|gain_pct| Self {
                gain_pct,
                close_pct: dec!(25),
            })
            .collect()
    }
}

/// Breakeven move settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakevenConfig {
    /// Move the stop to breakeven after the first take-profit.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fee-covering buffer beyond entry, in percent.
    #[serde(default = "default_breakeven_buffer_pct")]
    pub buffer_pct: Decimal,
    /// Profit (percent) that moves the stop to breakeven before TP1.
    #[serde(default)]
    pub proactive_trigger_pct: Option<Decimal>,
}

impl Default for BreakevenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_pct: default_breakeven_buffer_pct(),
            proactive_trigger_pct: None,
        }
    }
}

/// Trailing stop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Trailing enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Distance from the watermark, in percent.
    #[serde(default = "default_trail_pct")]
    pub trail_pct: Decimal,
    /// Profit (percent) that arms trailing on its own.
    #[serde(default)]
    pub activation_pct: Option<Decimal>,
    /// Arm trailing once TP1 has hit and breakeven is in place.
    #[serde(default = "default_true")]
    pub activate_after_breakeven: bool,
    /// Minimum stop improvement (percent) before a ratchet is pushed.
    #[serde(default = "default_min_update_pct")]
    pub min_update_pct: Decimal,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trail_pct: default_trail_pct(),
            activation_pct: None,
            activate_after_breakeven: true,
            min_update_pct: default_min_update_pct(),
        }
    }
}

impl TrailingConfig {
    /// Parameters copied onto a new position.
    #[must_use]
    pub fn params(&self) -> TrailingParams {
        if !self.enabled {
            return TrailingParams::disabled();
        }
        TrailingParams {
            enabled: true,
            trail_pct: self.trail_pct,
            activation_pct: self.activation_pct,
            activate_after_breakeven: self.activate_after_breakeven,
            min_update_pct: self.min_update_pct,
        }
    }
}

/// Circuit-breaker thresholds, shared by the global breaker and every mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Breaker enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cumulative loss per wall-clock hour that trips the breaker.
    #[serde(default = "default_max_loss_per_hour")]
    pub max_loss_per_hour: Decimal,
    /// Cumulative loss per wall-clock day that trips the breaker.
    #[serde(default = "default_max_loss_per_day")]
    pub max_loss_per_day: Decimal,
    /// Consecutive losing trades that trip the breaker.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Entries allowed per rolling minute.
    #[serde(default = "default_max_trades_per_minute")]
    pub max_trades_per_minute: u32,
    /// Entries allowed per rolling hour.
    #[serde(default = "default_max_trades_per_hour")]
    pub max_trades_per_hour: u32,
    /// Entries allowed per rolling day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    /// Minimum win rate (percent) once the sample is large enough.
    #[serde(default = "default_min_win_rate_pct")]
    pub min_win_rate_pct: Decimal,
    /// Trades needed before the win rate is enforced.
    #[serde(default = "default_win_rate_sample_size")]
    pub win_rate_sample_size: usize,
    /// Pause length after a trip.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    /// Clear the pause automatically when the cooldown expires.
    #[serde(default = "default_true")]
    pub auto_resume: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_loss_per_hour: default_max_loss_per_hour(),
            max_loss_per_day: default_max_loss_per_day(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_minute: default_max_trades_per_minute(),
            max_trades_per_hour: default_max_trades_per_hour(),
            max_trades_per_day: default_max_trades_per_day(),
            min_win_rate_pct: default_min_win_rate_pct(),
            win_rate_sample_size: default_win_rate_sample_size(),
            cooldown_minutes: default_cooldown_minutes(),
            auto_resume: true,
        }
    }
}

impl BreakerConfig {
    /// Account-wide defaults: looser than a single mode.
    #[must_use]
    pub fn global_default() -> Self {
        Self {
            max_loss_per_hour: dec!(300),
            max_loss_per_day: dec!(1000),
            max_consecutive_losses: 5,
            max_trades_per_minute: 10,
            max_trades_per_hour: 60,
            max_trades_per_day: 300,
            min_win_rate_pct: dec!(40),
            win_rate_sample_size: 30,
            cooldown_minutes: 60,
            ..Self::default()
        }
    }
}

/// Configuration of one trading mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Mode accepts new entries.
    #[serde(default)]
    pub enabled: bool,
    /// Concurrent positions in this mode's bucket.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Preferred notional per position.
    #[serde(default = "default_base_position_usd")]
    pub base_position_usd: Decimal,
    /// Smallest notional per position.
    #[serde(default = "default_min_position_usd")]
    pub min_position_usd: Decimal,
    /// Largest notional per position.
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: Decimal,
    /// Leverage.
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Default stop distance from entry, in percent.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Default take-profit ladder.
    #[serde(default = "default_take_profits")]
    pub take_profits: Vec<TakeProfitLevelConfig>,
    /// Breakeven settings.
    #[serde(default)]
    pub breakeven: BreakevenConfig,
    /// Trailing settings.
    #[serde(default)]
    pub trailing: TrailingConfig,
    /// Share of balance this bucket may commit, in percent.
    #[serde(default = "default_allocation_pct")]
    pub allocation_pct: Decimal,
    /// Mode circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Force-close positions held longer than this.
    #[serde(default)]
    pub max_hold_secs: Option<u64>,
    /// Advisory SL/TP poll interval.
    #[serde(default = "default_advisory_interval_secs")]
    pub advisory_interval_secs: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_positions: default_max_positions(),
            base_position_usd: default_base_position_usd(),
            min_position_usd: default_min_position_usd(),
            max_position_usd: default_max_position_usd(),
            leverage: default_leverage(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profits: default_take_profits(),
            breakeven: BreakevenConfig::default(),
            trailing: TrailingConfig::default(),
            allocation_pct: default_allocation_pct(),
            breaker: BreakerConfig::default(),
            max_hold_secs: None,
            advisory_interval_secs: default_advisory_interval_secs(),
        }
    }
}

impl ModeConfig {
    /// Built-in defaults for `mode`.
    #[must_use]
    pub fn for_mode(mode: TradingMode) -> Self {
        match mode {
            TradingMode::UltraFast => Self {
                max_positions: 2,
                base_position_usd: dec!(50),
                max_position_usd: dec!(200),
                stop_loss_pct: dec!(0.5),
                take_profits: TakeProfitLevelConfig::ladder([
                    dec!(0.2),
                    dec!(0.4),
                    dec!(0.6),
                    dec!(1.0),
                ]),
                trailing: TrailingConfig {
                    trail_pct: dec!(0.2),
                    ..TrailingConfig::default()
                },
                allocation_pct: dec!(10),
                max_hold_secs: Some(1800),
                ..Self::default()
            },
            TradingMode::Scalp => Self {
                enabled: true,
                ..Self::default()
            },
            TradingMode::ScalpReentry => Self {
                allocation_pct: Decimal::ZERO,
                ..Self::default()
            },
            TradingMode::Swing => Self {
                enabled: true,
                base_position_usd: dec!(200),
                min_position_usd: dec!(50),
                max_position_usd: dec!(1000),
                leverage: 5,
                stop_loss_pct: dec!(2),
                take_profits: TakeProfitLevelConfig::ladder([
                    dec!(3),
                    dec!(6),
                    dec!(10),
                    dec!(15),
                ]),
                breakeven: BreakevenConfig {
                    proactive_trigger_pct: Some(dec!(1.5)),
                    ..BreakevenConfig::default()
                },
                trailing: TrailingConfig {
                    trail_pct: dec!(1.5),
                    activation_pct: Some(dec!(2.0)),
                    ..TrailingConfig::default()
                },
                allocation_pct: dec!(40),
                advisory_interval_secs: 300,
                ..Self::default()
            },
            TradingMode::Position => Self {
                max_positions: 2,
                base_position_usd: dec!(300),
                min_position_usd: dec!(100),
                max_position_usd: dec!(2000),
                leverage: 3,
                stop_loss_pct: dec!(5),
                take_profits: TakeProfitLevelConfig::ladder([
                    dec!(10),
                    dec!(20),
                    dec!(35),
                    dec!(50),
                ]),
                trailing: TrailingConfig {
                    trail_pct: dec!(3.0),
                    activation_pct: Some(dec!(5.0)),
                    ..TrailingConfig::default()
                },
                allocation_pct: dec!(20),
                advisory_interval_secs: 900,
                ..Self::default()
            },
        }
    }
}

/// Every mode's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModesConfig {
    /// Ultra-fast mode.
    #[serde(default = "default_ultra_fast")]
    pub ultra_fast: ModeConfig,
    /// Scalp mode.
    #[serde(default = "default_scalp")]
    pub scalp: ModeConfig,
    /// Scalp re-entry specialization.
    #[serde(default = "default_scalp_reentry")]
    pub scalp_reentry: ModeConfig,
    /// Swing mode.
    #[serde(default = "default_swing")]
    pub swing: ModeConfig,
    /// Position mode.
    #[serde(default = "default_position")]
    pub position: ModeConfig,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            ultra_fast: default_ultra_fast(),
            scalp: default_scalp(),
            scalp_reentry: default_scalp_reentry(),
            swing: default_swing(),
            position: default_position(),
        }
    }
}

impl ModesConfig {
    /// Record for `mode`.
    #[must_use]
    pub const fn get(&self, mode: TradingMode) -> &ModeConfig {
        match mode {
            TradingMode::UltraFast => &self.ultra_fast,
            TradingMode::Scalp => &self.scalp,
            TradingMode::ScalpReentry => &self.scalp_reentry,
            TradingMode::Swing => &self.swing,
            TradingMode::Position => &self.position,
        }
    }

    /// Mutable record for `mode`.
    pub fn get_mut(&mut self, mode: TradingMode) -> &mut ModeConfig {
        match mode {
            TradingMode::UltraFast => &mut self.ultra_fast,
            TradingMode::Scalp => &mut self.scalp,
            TradingMode::ScalpReentry => &mut self.scalp_reentry,
            TradingMode::Swing => &mut self.swing,
            TradingMode::Position => &mut self.position,
        }
    }

    /// Record that owns the budget and breaker for `mode`.
    #[must_use]
    pub fn bucket(&self, mode: TradingMode) -> &ModeConfig {
        self.get(mode.base_mode())
    }

    /// Modes currently accepting entries.
    pub fn enabled(&self) -> impl Iterator<Item = TradingMode> + '_ {
        TradingMode::ALL
            .into_iter()
            .filter(|m| self.get(*m).enabled)
    }
}

fn default_ultra_fast() -> ModeConfig {
    ModeConfig::for_mode(TradingMode::UltraFast)
}

fn default_scalp() -> ModeConfig {
    ModeConfig::for_mode(TradingMode::Scalp)
}

fn default_scalp_reentry() -> ModeConfig {
    ModeConfig::for_mode(TradingMode::ScalpReentry)
}

fn default_swing() -> ModeConfig {
    ModeConfig::for_mode(TradingMode::Swing)
}

fn default_position() -> ModeConfig {
    ModeConfig::for_mode(TradingMode::Position)
}

const fn default_true() -> bool {
    true
}

const fn default_max_positions() -> usize {
    3
}

fn default_base_position_usd() -> Decimal {
    dec!(100)
}

fn default_min_position_usd() -> Decimal {
    dec!(25)
}

fn default_max_position_usd() -> Decimal {
    dec!(500)
}

const fn default_leverage() -> u32 {
    10
}

fn default_stop_loss_pct() -> Decimal {
    dec!(1.0)
}

fn default_take_profits() -> Vec<TakeProfitLevelConfig> {
    TakeProfitLevelConfig::ladder([dec!(0.3), dec!(0.6), dec!(1.0), dec!(1.5)])
}

fn default_breakeven_buffer_pct() -> Decimal {
    dec!(0.1)
}

fn default_trail_pct() -> Decimal {
    dec!(0.3)
}

fn default_min_update_pct() -> Decimal {
    dec!(0.2)
}

fn default_allocation_pct() -> Decimal {
    dec!(30)
}

const fn default_advisory_interval_secs() -> u64 {
    60
}

fn default_max_loss_per_hour() -> Decimal {
    dec!(100)
}

fn default_max_loss_per_day() -> Decimal {
    dec!(300)
}

const fn default_max_consecutive_losses() -> u32 {
    3
}

const fn default_max_trades_per_minute() -> u32 {
    5
}

const fn default_max_trades_per_hour() -> u32 {
    20
}

const fn default_max_trades_per_day() -> u32 {
    100
}

fn default_min_win_rate_pct() -> Decimal {
    dec!(50)
}

const fn default_win_rate_sample_size() -> usize {
    20
}

const fn default_cooldown_minutes() -> u64 {
    30
}
