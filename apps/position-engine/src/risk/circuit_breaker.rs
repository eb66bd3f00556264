//! Trading circuit breaker.
//!
//! One instance guards the whole account and one guards each base mode.
//!
//! # Gates
//!
//! ```text
//! paused?                     → reject (auto-resume once the cooldown passes)
//! trades per minute/hour/day  → reject, no pause
//! loss per hour/day           → trip + pause
//! consecutive losses          → trip + pause
//! win rate below minimum      → trip + pause (after the sample fills)
//! ```
//!
//! Loss accumulators reset on wall-clock hour and day boundaries. Trade-rate
//! windows are rolling.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, DurationRound, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::BreakerConfig;
use crate::domain::TradingMode;

/// What a breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// Every entry.
    Global,
    /// Entries in one base mode bucket.
    Mode(TradingMode),
}

impl std::fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Mode(mode) => write!(f, "{mode}"),
        }
    }
}

/// Why a breaker paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BreakerTrip {
    /// Hourly loss limit reached.
    HourlyLoss {
        /// Loss this hour.
        loss: Decimal,
        /// Limit.
        limit: Decimal,
    },
    /// Daily loss limit reached.
    DailyLoss {
        /// Loss today.
        loss: Decimal,
        /// Limit.
        limit: Decimal,
    },
    /// Too many losses in a row.
    ConsecutiveLosses {
        /// Losing streak.
        count: u32,
    },
    /// Win rate under the floor.
    LowWinRate {
        /// Observed win rate, percent.
        win_rate_pct: Decimal,
        /// Floor, percent.
        minimum_pct: Decimal,
    },
}

impl BreakerTrip {
    /// Stable label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::HourlyLoss { .. } => "hourly_loss",
            Self::DailyLoss { .. } => "daily_loss",
            Self::ConsecutiveLosses { .. } => "consecutive_losses",
            Self::LowWinRate { .. } => "low_win_rate",
        }
    }
}

impl std::fmt::Display for BreakerTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HourlyLoss { loss, limit } => write!(f, "hourly loss {loss} >= {limit}"),
            Self::DailyLoss { loss, limit } => write!(f, "daily loss {loss} >= {limit}"),
            Self::ConsecutiveLosses { count } => write!(f, "{count} consecutive losses"),
            Self::LowWinRate {
                win_rate_pct,
                minimum_pct,
            } => write!(f, "win rate {win_rate_pct}% < {minimum_pct}%"),
        }
    }
}

/// Trade-rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    /// Rolling minute.
    Minute,
    /// Rolling hour.
    Hour,
    /// Rolling day.
    Day,
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// A breaker refusing an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerBlock {
    /// Paused after a trip.
    Paused {
        /// Trip that caused the pause.
        reason: BreakerTrip,
        /// Pause deadline.
        until: DateTime<Utc>,
    },
    /// Trade-rate limit reached.
    RateLimited {
        /// Window that is full.
        window: RateWindow,
        /// Limit for that window.
        limit: u32,
    },
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    /// Scope.
    pub scope: BreakerScope,
    /// Pause deadline, if paused.
    pub paused_until: Option<DateTime<Utc>>,
    /// Pause reason, if paused.
    pub pause_reason: Option<BreakerTrip>,
    /// Entries in the last hour.
    pub trades_last_hour: usize,
    /// Loss this wall-clock hour.
    pub hour_loss: Decimal,
    /// Loss this wall-clock day.
    pub day_loss: Decimal,
    /// Current losing streak.
    pub consecutive_losses: u32,
    /// Win rate over the sample window, once it is full.
    pub win_rate_pct: Option<Decimal>,
}

#[derive(Debug)]
struct BreakerState {
    trades: VecDeque<DateTime<Utc>>,
    hour_loss: Decimal,
    day_loss: Decimal,
    hour_start: DateTime<Utc>,
    day_start: DateTime<Utc>,
    consecutive_losses: u32,
    outcomes: VecDeque<bool>,
    paused_until: Option<DateTime<Utc>>,
    pause_reason: Option<BreakerTrip>,
}

impl BreakerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            trades: VecDeque::new(),
            hour_loss: Decimal::ZERO,
            day_loss: Decimal::ZERO,
            hour_start: hour_floor(now),
            day_start: day_floor(now),
            consecutive_losses: 0,
            outcomes: VecDeque::new(),
            paused_until: None,
            pause_reason: None,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let hour = hour_floor(now);
        if hour != self.hour_start {
            self.hour_start = hour;
            self.hour_loss = Decimal::ZERO;
        }
        let day = day_floor(now);
        if day != self.day_start {
            self.day_start = day;
            self.day_loss = Decimal::ZERO;
        }
        let horizon = now - Duration::days(1);
        while self.trades.front().is_some_and(|t| *t <= horizon) {
            self.trades.pop_front();
        }
    }

    fn trades_since(&self, since: DateTime<Utc>) -> usize {
        self.trades.iter().rev().take_while(|t| **t > since).count()
    }

    fn win_rate_pct(&self, sample: usize) -> Option<Decimal> {
        if sample == 0 || self.outcomes.len() < sample {
            return None;
        }
        let wins = self.outcomes.iter().filter(|w| **w).count();
        Some(Decimal::from(wins) * dec!(100) / Decimal::from(self.outcomes.len()))
    }
}

fn hour_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::hours(1)).unwrap_or(t)
}

fn day_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::days(1)).unwrap_or(t)
}

/// Loss/rate/win-rate circuit breaker for one scope.
#[derive(Debug)]
pub struct TradingCircuitBreaker {
    scope: BreakerScope,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
}

impl TradingCircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(scope: BreakerScope, config: BreakerConfig) -> Self {
        Self {
            scope,
            config,
            state: RwLock::new(BreakerState::new(Utc::now())),
        }
    }

    /// Scope.
    #[must_use]
    pub const fn scope(&self) -> BreakerScope {
        self.scope
    }

    /// Gate a new entry.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), BreakerBlock> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.roll(now);

        if let Some(until) = state.paused_until {
            if now < until || !self.config.auto_resume {
                return Err(BreakerBlock::Paused {
                    reason: state
                        .pause_reason
                        .clone()
                        .unwrap_or(BreakerTrip::ConsecutiveLosses { count: 0 }),
                    until,
                });
            }
            tracing::info!(scope = %self.scope, "Circuit breaker cooldown expired, resuming");
            state.paused_until = None;
            state.pause_reason = None;
        }

        for (window, span, limit) in [
            (RateWindow::Minute, Duration::minutes(1), self.config.max_trades_per_minute),
            (RateWindow::Hour, Duration::hours(1), self.config.max_trades_per_hour),
            (RateWindow::Day, Duration::days(1), self.config.max_trades_per_day),
        ] {
            if state.trades_since(now - span) >= limit as usize {
                return Err(BreakerBlock::RateLimited { window, limit });
            }
        }

        if let Some(trip) = self.breached(&state) {
            let until = self.trip(&mut state, trip.clone(), now);
            return Err(BreakerBlock::Paused {
                reason: trip,
                until,
            });
        }
        Ok(())
    }

    /// Whether new entries are currently refused because of a pause.
    #[must_use]
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .paused_until
            .is_some_and(|until| now < until || !self.config.auto_resume)
    }

    /// Record an entry for the rate windows.
    pub fn record_open(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.roll(now);
        state.trades.push_back(now);
    }

    /// Record a closed trade. Trips immediately when a threshold is breached.
    pub fn record_outcome(&self, pnl: Decimal, now: DateTime<Utc>) -> Option<BreakerTrip> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.roll(now);

        if pnl < Decimal::ZERO {
            state.hour_loss += -pnl;
            state.day_loss += -pnl;
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        state.outcomes.push_back(pnl > Decimal::ZERO);
        while state.outcomes.len() > self.config.win_rate_sample_size.max(1) {
            state.outcomes.pop_front();
        }

        if !self.config.enabled || state.paused_until.is_some() {
            return None;
        }
        let trip = self.breached(&state)?;
        self.trip(&mut state, trip.clone(), now);
        Some(trip)
    }

    fn breached(&self, state: &BreakerState) -> Option<BreakerTrip> {
        let cfg = &self.config;
        if state.hour_loss >= cfg.max_loss_per_hour {
            return Some(BreakerTrip::HourlyLoss {
                loss: state.hour_loss,
                limit: cfg.max_loss_per_hour,
            });
        }
        if state.day_loss >= cfg.max_loss_per_day {
            return Some(BreakerTrip::DailyLoss {
                loss: state.day_loss,
                limit: cfg.max_loss_per_day,
            });
        }
        if cfg.max_consecutive_losses > 0 && state.consecutive_losses >= cfg.max_consecutive_losses
        {
            return Some(BreakerTrip::ConsecutiveLosses {
                count: state.consecutive_losses,
            });
        }
        if let Some(win_rate_pct) = state.win_rate_pct(cfg.win_rate_sample_size)
            && win_rate_pct < cfg.min_win_rate_pct
        {
            return Some(BreakerTrip::LowWinRate {
                win_rate_pct: win_rate_pct.round_dp(2),
                minimum_pct: cfg.min_win_rate_pct,
            });
        }
        None
    }

    fn trip(&self, state: &mut BreakerState, trip: BreakerTrip, now: DateTime<Utc>) -> DateTime<Utc> {
        let minutes = i64::try_from(self.config.cooldown_minutes).unwrap_or(i64::MAX / 60_000);
        let until = now + Duration::minutes(minutes);
        tracing::warn!(
            scope = %self.scope,
            reason = %trip,
            until = %until,
            "Circuit breaker tripped"
        );
        crate::observability::metrics::record_breaker_trip(&self.scope.to_string(), trip.label());
        state.paused_until = Some(until);
        state.pause_reason = Some(trip);
        // A fresh streak and sample after the cooldown.
        state.consecutive_losses = 0;
        state.outcomes.clear();
        until
    }

    /// Reset wall-clock loss accumulators whose period has ended.
    pub fn roll_counters(&self, now: DateTime<Utc>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .roll(now);
    }

    /// Clear every counter and any pause.
    pub fn reset(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = BreakerState::new(Utc::now());
        tracing::info!(scope = %self.scope, "Circuit breaker reset");
    }

    /// Current view.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let paused = state
            .paused_until
            .filter(|until| now < *until || !self.config.auto_resume);
        BreakerStatus {
            scope: self.scope,
            paused_until: paused,
            pause_reason: paused.and(state.pause_reason.clone()),
            trades_last_hour: state.trades_since(now - Duration::hours(1)),
            hour_loss: state.hour_loss,
            day_loss: state.day_loss,
            consecutive_losses: state.consecutive_losses,
            win_rate_pct: state.win_rate_pct(self.config.win_rate_sample_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_loss_per_hour: dec!(100),
            max_loss_per_day: dec!(300),
            max_consecutive_losses: 3,
            max_trades_per_minute: 2,
            max_trades_per_hour: 20,
            max_trades_per_day: 100,
            min_win_rate_pct: dec!(50),
            win_rate_sample_size: 4,
            cooldown_minutes: 30,
            ..BreakerConfig::default()
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        // 2024-01-01T00:00:00Z
        DateTime::from_timestamp(1_704_067_200, 0).unwrap() + Duration::minutes(minutes)
    }

    fn breaker() -> TradingCircuitBreaker {
        let b = TradingCircuitBreaker::new(BreakerScope::Mode(TradingMode::Scalp), config());
        b.reset();
        b.roll_counters(at(0));
        b
    }

    #[test]
    fn rate_limit_rejects_without_pausing() {
        let b = breaker();
        b.record_open(at(0));
        b.record_open(at(0));
        assert!(matches!(
            b.check(at(0)),
            Err(BreakerBlock::RateLimited {
                window: RateWindow::Minute,
                limit: 2
            })
        ));
        assert!(!b.is_paused(at(0)));
        assert!(b.check(at(2)).is_ok());
    }

    #[test]
    fn consecutive_losses_trip_and_auto_resume() {
        let b = breaker();
        assert_eq!(b.record_outcome(dec!(-5), at(1)), None);
        assert_eq!(b.record_outcome(dec!(-5), at(2)), None);
        assert_eq!(
            b.record_outcome(dec!(-5), at(3)),
            Some(BreakerTrip::ConsecutiveLosses { count: 3 })
        );
        assert!(matches!(b.check(at(10)), Err(BreakerBlock::Paused { .. })));
        assert!(b.check(at(34)).is_ok());
        assert_eq!(b.status(at(34)).consecutive_losses, 0);
    }

    #[test]
    fn pause_holds_without_auto_resume() {
        let b = TradingCircuitBreaker::new(
            BreakerScope::Global,
            BreakerConfig {
                auto_resume: false,
                ..config()
            },
        );
        b.roll_counters(at(0));
        b.record_outcome(dec!(-150), at(1));
        assert!(matches!(b.check(at(500)), Err(BreakerBlock::Paused { .. })));
        b.reset();
        assert!(b.check(Utc::now()).is_ok());
    }

    #[test]
    fn hourly_loss_resets_on_the_hour() {
        let b = breaker();
        b.record_outcome(dec!(-60), at(10));
        b.record_outcome(dec!(10), at(11));
        assert_eq!(b.status(at(20)).hour_loss, dec!(60));
        b.roll_counters(at(61));
        let status = b.status(at(61));
        assert_eq!(status.hour_loss, Decimal::ZERO);
        assert_eq!(status.day_loss, dec!(60));
    }

    #[test]
    fn hourly_loss_trips() {
        let b = breaker();
        let trip = b.record_outcome(dec!(-120), at(5));
        assert!(matches!(trip, Some(BreakerTrip::HourlyLoss { .. })));
        assert_eq!(b.status(at(6)).pause_reason.map(|t| t.label()), Some("hourly_loss"));
    }

    #[test]
    fn win_rate_enforced_after_sample() {
        let b = breaker();
        b.record_outcome(dec!(1), at(1));
        b.record_outcome(dec!(-1), at(2));
        b.record_outcome(dec!(1), at(3));
        b.record_outcome(dec!(-1), at(4));
        assert!(b.check(at(5)).is_ok());
        b.record_outcome(dec!(1), at(6));
        let trip = b.record_outcome(dec!(-1), at(7));
        // Sample of the last four: win, lose, win, lose = 50%.
        assert_eq!(trip, None);
        let trip = b.record_outcome(dec!(-1), at(8));
        assert!(matches!(trip, Some(BreakerTrip::LowWinRate { .. })));
    }

    #[test]
    fn disabled_breaker_never_blocks() {
        let b = TradingCircuitBreaker::new(
            BreakerScope::Global,
            BreakerConfig {
                enabled: false,
                ..config()
            },
        );
        for i in 0..5 {
            b.record_open(at(0));
            b.record_outcome(dec!(-500), at(i));
        }
        assert!(b.check(at(0)).is_ok());
    }
}
