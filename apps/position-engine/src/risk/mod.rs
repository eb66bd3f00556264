//! Entry gating: blocklist, capital allocation and circuit breakers.
//!
//! [`RiskGate::evaluate_entry`] runs the gates in a fixed order and stops at
//! the first refusal:
//!
//! 1. instrument not blocked
//! 2. mode bucket has margin and position headroom
//! 3. mode breaker (rate limits, losses, streak, win rate)
//! 4. global breaker
//!
//! Outcomes are fed to every gate on close, whichever gate would have
//! refused the trade.

pub mod allocation;
pub mod blocklist;
pub mod circuit_breaker;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::Config;
use crate::domain::{ProposalAction, TradingMode};
use crate::registry::PositionRegistry;

pub use allocation::{
    AllocationDenied, AllocationReservation, AllocationStatus, CapitalAllocator,
    OVER_ALLOCATION_TOLERANCE,
};
pub use blocklist::{BlockCause, BlockedInstrument, InstrumentBlocklist};
pub use circuit_breaker::{
    BreakerBlock, BreakerScope, BreakerStatus, BreakerTrip, RateWindow, TradingCircuitBreaker,
};

/// Why an entry was not taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The proposal is not a long or short.
    NotDirectional {
        /// Proposed action.
        action: ProposalAction,
    },
    /// The mode does not accept entries.
    ModeDisabled {
        /// Mode.
        mode: TradingMode,
    },
    /// A position is already open for the symbol.
    AlreadyOpen,
    /// Another entry for the symbol is in flight.
    EntryInFlight,
    /// The instrument is on the blocklist.
    InstrumentBlocked(BlockedInstrument),
    /// Capital allocation refused.
    Allocation(AllocationDenied),
    /// A circuit breaker refused.
    Breaker {
        /// Breaker scope.
        scope: BreakerScope,
        /// Refusal.
        block: BreakerBlock,
    },
    /// Usable balance is under the entry minimum.
    InsufficientBalance {
        /// Usable balance.
        usable: Decimal,
        /// Minimum.
        minimum: Decimal,
    },
    /// Funding settlement is close and expensive for this side.
    FundingCost {
        /// Cost for the side, percent per settlement.
        rate_pct: Decimal,
    },
    /// Sized notional is under the hard floor.
    SizeTooSmall {
        /// Sized notional.
        notional: Decimal,
        /// Floor.
        minimum: Decimal,
    },
    /// Sized quantity rounds below the venue minimum.
    DustQuantity {
        /// Rounded quantity.
        quantity: Decimal,
    },
    /// The exchange refused the entry order.
    ExchangeRejected {
        /// Exchange message.
        reason: String,
    },
}

impl RejectReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotDirectional { .. } => "not_directional",
            Self::ModeDisabled { .. } => "mode_disabled",
            Self::AlreadyOpen => "already_open",
            Self::EntryInFlight => "entry_in_flight",
            Self::InstrumentBlocked(_) => "instrument_blocked",
            Self::Allocation(_) => "allocation_limit",
            Self::Breaker {
                block: BreakerBlock::Paused { .. },
                ..
            } => "breaker_paused",
            Self::Breaker {
                block: BreakerBlock::RateLimited { .. },
                ..
            } => "rate_limited",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::FundingCost { .. } => "funding_cost",
            Self::SizeTooSmall { .. } => "size_too_small",
            Self::DustQuantity { .. } => "dust_quantity",
            Self::ExchangeRejected { .. } => "exchange_rejected",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDirectional { action } => write!(f, "{action:?} is not an entry"),
            Self::ModeDisabled { mode } => write!(f, "mode {mode} is disabled"),
            Self::AlreadyOpen => write!(f, "position already open"),
            Self::EntryInFlight => write!(f, "entry already in flight"),
            Self::InstrumentBlocked(block) => match block.until {
                Some(until) => write!(f, "instrument blocked ({}) until {until}", block.cause),
                None => write!(f, "instrument blocked ({}) until manual unblock", block.cause),
            },
            Self::Allocation(denied) => write!(f, "allocation limit: {denied}"),
            Self::Breaker {
                scope,
                block: BreakerBlock::Paused { reason, until },
            } => write!(f, "{scope} breaker paused until {until}: {reason}"),
            Self::Breaker {
                scope,
                block: BreakerBlock::RateLimited { window, limit },
            } => write!(f, "{scope} trade rate limit {limit} per {window}"),
            Self::InsufficientBalance { usable, minimum } => {
                write!(f, "usable balance {usable} below {minimum}")
            }
            Self::FundingCost { rate_pct } => {
                write!(f, "funding cost {rate_pct}% due before settlement")
            }
            Self::SizeTooSmall { notional, minimum } => {
                write!(f, "position size {notional} below {minimum}")
            }
            Self::DustQuantity { quantity } => write!(f, "quantity {quantity} below lot minimum"),
            Self::ExchangeRejected { reason } => write!(f, "exchange rejected entry: {reason}"),
        }
    }
}

/// A sized entry to be gated.
#[derive(Debug, Clone, Copy)]
pub struct EntryCandidate<'a> {
    /// Symbol.
    pub symbol: &'a str,
    /// Mode.
    pub mode: TradingMode,
    /// Notional.
    pub notional: Decimal,
    /// Leverage.
    pub leverage: u32,
    /// Account balance the budgets derive from.
    pub balance: Decimal,
}

/// All entry gates behind one interface.
#[derive(Debug)]
pub struct RiskGate {
    blocklist: InstrumentBlocklist,
    allocator: Arc<CapitalAllocator>,
    mode_breakers: HashMap<TradingMode, TradingCircuitBreaker>,
    global: TradingCircuitBreaker,
}

impl RiskGate {
    /// Build every gate from configuration.
    #[must_use]
    pub fn new(config: &Config, registry: Arc<PositionRegistry>) -> Self {
        let mode_breakers = TradingMode::base_modes()
            .map(|mode| {
                (
                    mode,
                    TradingCircuitBreaker::new(
                        BreakerScope::Mode(mode),
                        config.modes.get(mode).breaker.clone(),
                    ),
                )
            })
            .collect();
        Self {
            blocklist: InstrumentBlocklist::new(config.blocklist.clone()),
            allocator: Arc::new(CapitalAllocator::new(config.modes.clone(), registry)),
            mode_breakers,
            global: TradingCircuitBreaker::new(BreakerScope::Global, config.global_breaker.clone()),
        }
    }

    /// Blocklist.
    #[must_use]
    pub const fn blocklist(&self) -> &InstrumentBlocklist {
        &self.blocklist
    }

    /// Capital allocator.
    #[must_use]
    pub const fn allocator(&self) -> &Arc<CapitalAllocator> {
        &self.allocator
    }

    /// Breaker of the bucket `mode` belongs to.
    #[must_use]
    pub fn mode_breaker(&self, mode: TradingMode) -> Option<&TradingCircuitBreaker> {
        self.mode_breakers.get(&mode.base_mode())
    }

    /// Account-wide breaker.
    #[must_use]
    pub const fn global_breaker(&self) -> &TradingCircuitBreaker {
        &self.global
    }

    /// Run every gate in order. On success the margin stays reserved until
    /// the returned guard drops.
    pub fn evaluate_entry(
        &self,
        candidate: &EntryCandidate<'_>,
        now: DateTime<Utc>,
    ) -> Result<AllocationReservation, RejectReason> {
        if let Some(block) = self.blocklist.check(candidate.symbol, now) {
            return Err(RejectReason::InstrumentBlocked(block));
        }

        let reservation = self
            .allocator
            .try_reserve(
                candidate.symbol,
                candidate.mode,
                candidate.notional,
                candidate.leverage,
                candidate.balance,
            )
            .map_err(RejectReason::Allocation)?;

        if let Some(breaker) = self.mode_breaker(candidate.mode) {
            breaker.check(now).map_err(|block| RejectReason::Breaker {
                scope: breaker.scope(),
                block,
            })?;
        }
        self.global.check(now).map_err(|block| RejectReason::Breaker {
            scope: BreakerScope::Global,
            block,
        })?;

        Ok(reservation)
    }

    /// Record an entry in the rate windows.
    pub fn record_open(&self, mode: TradingMode, now: DateTime<Utc>) {
        if let Some(breaker) = self.mode_breaker(mode) {
            breaker.record_open(now);
        }
        self.global.record_open(now);
    }

    /// Feed a closed trade to the blocklist and both breakers.
    pub fn record_close(
        &self,
        symbol: &str,
        mode: TradingMode,
        pnl: Decimal,
        roi_pct: Decimal,
        now: DateTime<Utc>,
    ) {
        self.blocklist.record_outcome(symbol, roi_pct, now);
        if let Some(breaker) = self.mode_breaker(mode) {
            breaker.record_outcome(pnl, now);
        }
        self.global.record_outcome(pnl, now);
    }

    /// Reset loss accumulators whose wall-clock period ended.
    pub fn roll_counters(&self, now: DateTime<Utc>) {
        for breaker in self.mode_breakers.values() {
            breaker.roll_counters(now);
        }
        self.global.roll_counters(now);
    }

    /// Status of the global breaker followed by each mode breaker.
    #[must_use]
    pub fn breaker_statuses(&self, now: DateTime<Utc>) -> Vec<BreakerStatus> {
        let mut statuses = vec![self.global.status(now)];
        statuses.extend(
            TradingMode::base_modes()
                .filter_map(|mode| self.mode_breakers.get(&mode))
                .map(|breaker| breaker.status(now)),
        );
        statuses
    }
}
