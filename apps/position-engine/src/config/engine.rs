//! Engine-wide settings: loop cadence, protection, entry, fees, funding,
//! blocklist and advisory rules.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Account risk appetite; scales every position size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// 0.6x sizing.
    Conservative,
    /// 0.8x sizing.
    #[default]
    Moderate,
    /// 1.0x sizing.
    Aggressive,
}

impl RiskLevel {
    /// Size multiplier.
    #[must_use]
    pub fn multiplier(self) -> Decimal {
        match self {
            Self::Conservative => dec!(0.6),
            Self::Moderate => dec!(0.8),
            Self::Aggressive => Decimal::ONE,
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Paper trading against the simulated exchange.
    #[serde(default = "default_true")]
    pub paper: bool,
    /// Account risk appetite.
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Price monitor period.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Reconciliation runs every this many monitor ticks.
    #[serde(default = "default_reconcile_every_ticks")]
    pub reconcile_every_ticks: u32,
    /// Pending limit-entry sweep period.
    #[serde(default = "default_pending_sweep_interval_ms")]
    pub pending_sweep_interval_ms: u64,
    /// Trigger tolerance band for stop/target comparisons, in percent.
    #[serde(default = "default_trigger_tolerance_pct")]
    pub trigger_tolerance_pct: Decimal,
    /// Delay before a failed background task is restarted.
    #[serde(default = "default_task_restart_delay_ms")]
    pub task_restart_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            paper: true,
            risk_level: RiskLevel::default(),
            monitor_interval_ms: default_monitor_interval_ms(),
            reconcile_every_ticks: default_reconcile_every_ticks(),
            pending_sweep_interval_ms: default_pending_sweep_interval_ms(),
            trigger_tolerance_pct: default_trigger_tolerance_pct(),
            task_restart_delay_ms: default_task_restart_delay_ms(),
        }
    }
}

impl EngineSettings {
    /// Monitor period.
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Pending sweep period.
    #[must_use]
    pub const fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_interval_ms)
    }

    /// Restart delay for supervised tasks.
    #[must_use]
    pub const fn task_restart_delay(&self) -> Duration {
        Duration::from_millis(self.task_restart_delay_ms)
    }
}

/// Protection guardian settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Guardian period.
    #[serde(default = "default_guardian_interval_ms")]
    pub guardian_interval_ms: u64,
    /// Heal attempts before emergency close.
    #[serde(default = "default_max_heal_attempts")]
    pub max_heal_attempts: u32,
    /// Longest a position may run without a verified stop.
    #[serde(default = "default_max_unprotected_secs")]
    pub max_unprotected_secs: u64,
    /// Placements younger than this are left to finish before verification.
    #[serde(default = "default_placement_grace_secs")]
    pub placement_grace_secs: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            guardian_interval_ms: default_guardian_interval_ms(),
            max_heal_attempts: default_max_heal_attempts(),
            max_unprotected_secs: default_max_unprotected_secs(),
            placement_grace_secs: default_placement_grace_secs(),
        }
    }
}

impl ProtectionConfig {
    /// Guardian period.
    #[must_use]
    pub const fn guardian_interval(&self) -> Duration {
        Duration::from_millis(self.guardian_interval_ms)
    }
}

/// Entry and exit execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Status polls before a market fill is declared unconfirmed.
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    /// Delay between status polls.
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    /// Resting limit entries are cancelled after this long.
    #[serde(default = "default_limit_timeout_secs")]
    pub limit_timeout_secs: u64,
    /// Partial fill share (percent) that counts as filled on timeout.
    #[serde(default = "default_partial_completion_pct")]
    pub partial_completion_pct: Decimal,
    /// Try a marketable limit before a market exit.
    #[serde(default = "default_true")]
    pub close_with_limit: bool,
    /// Price buffer for limit exits, in percent.
    #[serde(default = "default_close_limit_buffer_pct")]
    pub close_limit_buffer_pct: Decimal,
    /// Smallest usable balance that allows an entry.
    #[serde(default = "default_min_balance_usd")]
    pub min_balance_usd: Decimal,
    /// Share of available balance used for sizing, in percent.
    #[serde(default = "default_usable_balance_pct")]
    pub usable_balance_pct: Decimal,
    /// Hard floor on order notional.
    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: Decimal,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            fill_poll_attempts: default_fill_poll_attempts(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            limit_timeout_secs: default_limit_timeout_secs(),
            partial_completion_pct: default_partial_completion_pct(),
            close_with_limit: true,
            close_limit_buffer_pct: default_close_limit_buffer_pct(),
            min_balance_usd: default_min_balance_usd(),
            usable_balance_pct: default_usable_balance_pct(),
            min_order_usd: default_min_order_usd(),
        }
    }
}

impl EntryConfig {
    /// Delay between status polls.
    #[must_use]
    pub const fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }
}

/// Exchange fee schedule, in percent of notional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeesConfig {
    /// Taker fee.
    #[serde(default = "default_taker_pct")]
    pub taker_pct: Decimal,
    /// Maker fee.
    #[serde(default = "default_maker_pct")]
    pub maker_pct: Decimal,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            taker_pct: default_taker_pct(),
            maker_pct: default_maker_pct(),
        }
    }
}

impl FeesConfig {
    /// Taker fee on `notional`.
    #[must_use]
    pub fn taker_fee(&self, notional: Decimal) -> Decimal {
        notional * self.taker_pct / dec!(100)
    }

    /// Maker fee on `notional`.
    #[must_use]
    pub fn maker_fee(&self, notional: Decimal) -> Decimal {
        notional * self.maker_pct / dec!(100)
    }
}

/// Funding-rate awareness thresholds. Costs are in percent per settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingConfig {
    /// Funding checks enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cost above which entries near settlement are rejected.
    #[serde(default = "default_funding_block_pct")]
    pub block_threshold_pct: Decimal,
    /// Settlement window (minutes) in which expensive entries are rejected.
    #[serde(default = "default_funding_block_window_mins")]
    pub block_window_mins: i64,
    /// Cost above which entries shrink by 25%.
    #[serde(default = "default_funding_shrink_pct")]
    pub shrink_threshold_pct: Decimal,
    /// Cost above which entries shrink by 50%.
    #[serde(default = "default_funding_heavy_shrink_pct")]
    pub heavy_shrink_threshold_pct: Decimal,
    /// Settlement window (minutes) in which profitable positions may exit.
    #[serde(default = "default_funding_exit_window_mins")]
    pub exit_window_mins: i64,
    /// Exit when the funding fee exceeds this share of unrealized profit.
    #[serde(default = "default_funding_exit_profit_share_pct")]
    pub exit_profit_share_pct: Decimal,
    /// Exit when the cost exceeds this outright.
    #[serde(default = "default_funding_exit_rate_pct")]
    pub exit_rate_pct: Decimal,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold_pct: default_funding_block_pct(),
            block_window_mins: default_funding_block_window_mins(),
            shrink_threshold_pct: default_funding_shrink_pct(),
            heavy_shrink_threshold_pct: default_funding_heavy_shrink_pct(),
            exit_window_mins: default_funding_exit_window_mins(),
            exit_profit_share_pct: default_funding_exit_profit_share_pct(),
            exit_rate_pct: default_funding_exit_rate_pct(),
        }
    }
}

/// Per-instrument blocklist thresholds. ROI values are leveraged percent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistConfig {
    /// Blocklist enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A single loss at or below this ROI blocks the instrument.
    #[serde(default = "default_big_loss_roi_pct")]
    pub big_loss_roi_pct: Decimal,
    /// Consecutive losses that block the instrument.
    #[serde(default = "default_consecutive_losses")]
    pub consecutive_losses: u32,
    /// The last loss of the run must be at or below this ROI.
    #[serde(default = "default_consecutive_loss_roi_pct")]
    pub consecutive_loss_roi_pct: Decimal,
    /// First-offense block length.
    #[serde(default = "default_block_cooldown_mins")]
    pub cooldown_mins: i64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            big_loss_roi_pct: default_big_loss_roi_pct(),
            consecutive_losses: default_consecutive_losses(),
            consecutive_loss_roi_pct: default_consecutive_loss_roi_pct(),
            cooldown_mins: default_block_cooldown_mins(),
        }
    }
}

/// Advisory stop-update validation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Poll the advisory port.
    #[serde(default)]
    pub enabled: bool,
    /// Largest stop move accepted in one update, in percent.
    #[serde(default = "default_advisory_max_move_pct")]
    pub max_move_pct: Decimal,
    /// Closest a stop may sit to the current price, in percent.
    #[serde(default = "default_advisory_min_distance_pct")]
    pub min_distance_pct: Decimal,
    /// Updates kept per symbol in the history.
    #[serde(default = "default_advisory_history")]
    pub history_len: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_move_pct: default_advisory_max_move_pct(),
            min_distance_pct: default_advisory_min_distance_pct(),
            history_len: default_advisory_history(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_monitor_interval_ms() -> u64 {
    5_000
}

const fn default_reconcile_every_ticks() -> u32 {
    6
}

const fn default_pending_sweep_interval_ms() -> u64 {
    5_000
}

fn default_trigger_tolerance_pct() -> Decimal {
    dec!(0.01)
}

const fn default_task_restart_delay_ms() -> u64 {
    1_000
}

const fn default_guardian_interval_ms() -> u64 {
    5_000
}

const fn default_max_heal_attempts() -> u32 {
    3
}

const fn default_max_unprotected_secs() -> u64 {
    30
}

const fn default_placement_grace_secs() -> u64 {
    10
}

const fn default_fill_poll_attempts() -> u32 {
    5
}

const fn default_fill_poll_interval_ms() -> u64 {
    1_000
}

const fn default_limit_timeout_secs() -> u64 {
    300
}

fn default_partial_completion_pct() -> Decimal {
    dec!(80)
}

fn default_close_limit_buffer_pct() -> Decimal {
    dec!(0.1)
}

fn default_min_balance_usd() -> Decimal {
    dec!(25)
}

fn default_usable_balance_pct() -> Decimal {
    dec!(90)
}

fn default_min_order_usd() -> Decimal {
    dec!(10)
}

fn default_taker_pct() -> Decimal {
    dec!(0.04)
}

fn default_maker_pct() -> Decimal {
    dec!(0.02)
}

fn default_funding_block_pct() -> Decimal {
    dec!(0.1)
}

const fn default_funding_block_window_mins() -> i64 {
    30
}

fn default_funding_shrink_pct() -> Decimal {
    dec!(0.1)
}

fn default_funding_heavy_shrink_pct() -> Decimal {
    dec!(0.2)
}

const fn default_funding_exit_window_mins() -> i64 {
    10
}

fn default_funding_exit_profit_share_pct() -> Decimal {
    dec!(30)
}

fn default_funding_exit_rate_pct() -> Decimal {
    dec!(0.3)
}

fn default_big_loss_roi_pct() -> Decimal {
    dec!(-50)
}

const fn default_consecutive_losses() -> u32 {
    3
}

fn default_consecutive_loss_roi_pct() -> Decimal {
    dec!(-20)
}

const fn default_block_cooldown_mins() -> i64 {
    120
}

fn default_advisory_max_move_pct() -> Decimal {
    dec!(10)
}

fn default_advisory_min_distance_pct() -> Decimal {
    dec!(0.5)
}

const fn default_advisory_history() -> usize {
    20
}
