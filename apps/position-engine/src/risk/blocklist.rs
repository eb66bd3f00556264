//! Per-instrument blocklist.
//!
//! An instrument is blocked after a single close at or below
//! `big_loss_roi_pct`, or after `consecutive_losses` losing closes in a row
//! where the last one is at or below `consecutive_loss_roi_pct`. The first
//! offense expires after the cooldown; any later offense stays until
//! [`InstrumentBlocklist::unblock`] is called.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::BlocklistConfig;

/// Why an instrument was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    /// One close lost more than the big-loss threshold.
    BigLoss,
    /// A run of losing closes.
    ConsecutiveLosses,
}

impl std::fmt::Display for BlockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BigLoss => write!(f, "big_loss"),
            Self::ConsecutiveLosses => write!(f, "consecutive_losses"),
        }
    }
}

/// An active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedInstrument {
    /// Symbol.
    pub symbol: String,
    /// Cause of the latest offense.
    pub cause: BlockCause,
    /// Expiry; `None` means a manual unblock is required.
    pub until: Option<DateTime<Utc>>,
    /// Offenses so far.
    pub offenses: u32,
}

#[derive(Debug, Clone, Default)]
struct InstrumentRecord {
    consecutive_losses: u32,
    offenses: u32,
    blocked: Option<(BlockCause, Option<DateTime<Utc>>)>,
}

/// Blocklist keyed by symbol.
#[derive(Debug)]
pub struct InstrumentBlocklist {
    config: BlocklistConfig,
    records: RwLock<HashMap<String, InstrumentRecord>>,
}

impl InstrumentBlocklist {
    /// Empty blocklist.
    #[must_use]
    pub fn new(config: BlocklistConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// The active block on `symbol`, clearing it if the cooldown has passed.
    pub fn check(&self, symbol: &str, now: DateTime<Utc>) -> Option<BlockedInstrument> {
        if !self.config.enabled {
            return None;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(symbol)?;
        let (cause, until) = record.blocked?;
        if until.is_some_and(|deadline| now >= deadline) {
            tracing::info!(symbol, "Instrument block expired");
            record.blocked = None;
            return None;
        }
        Some(BlockedInstrument {
            symbol: symbol.to_string(),
            cause,
            until,
            offenses: record.offenses,
        })
    }

    /// Feed a closed trade's leveraged ROI. Returns the new block, if any.
    pub fn record_outcome(
        &self,
        symbol: &str,
        roi_pct: Decimal,
        now: DateTime<Utc>,
    ) -> Option<BlockedInstrument> {
        if !self.config.enabled {
            return None;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(symbol.to_string()).or_default();

        if roi_pct >= Decimal::ZERO {
            record.consecutive_losses = 0;
            return None;
        }
        record.consecutive_losses += 1;

        let cause = if roi_pct <= self.config.big_loss_roi_pct {
            BlockCause::BigLoss
        } else if record.consecutive_losses >= self.config.consecutive_losses
            && roi_pct <= self.config.consecutive_loss_roi_pct
        {
            BlockCause::ConsecutiveLosses
        } else {
            return None;
        };

        record.offenses += 1;
        record.consecutive_losses = 0;
        let until = (record.offenses == 1).then(|| now + Duration::minutes(self.config.cooldown_mins));
        record.blocked = Some((cause, until));

        tracing::warn!(
            symbol,
            cause = %cause,
            roi_pct = %roi_pct,
            offenses = record.offenses,
            until = ?until,
            "Instrument blocked"
        );
        crate::observability::metrics::record_instrument_blocked(until.is_none());

        Some(BlockedInstrument {
            symbol: symbol.to_string(),
            cause,
            until,
            offenses: record.offenses,
        })
    }

    /// Lift a block. Returns `false` if the symbol was not blocked.
    pub fn unblock(&self, symbol: &str) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let lifted = records
            .get_mut(symbol)
            .and_then(|record| record.blocked.take())
            .is_some();
        if lifted {
            tracing::info!(symbol, "Instrument manually unblocked");
        }
        lifted
    }

    /// Forget a symbol's offenses and streak.
    pub fn reset_history(&self, symbol: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol);
    }

    /// Every active block, ordered by symbol.
    #[must_use]
    pub fn blocked(&self, now: DateTime<Utc>) -> Vec<BlockedInstrument> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut blocked: Vec<_> = records
            .iter()
            .filter_map(|(symbol, record)| {
                let (cause, until) = record.blocked?;
                if until.is_some_and(|deadline| now >= deadline) {
                    return None;
                }
                Some(BlockedInstrument {
                    symbol: symbol.clone(),
                    cause,
                    until,
                    offenses: record.offenses,
                })
            })
            .collect();
        blocked.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn blocklist() -> InstrumentBlocklist {
        InstrumentBlocklist::new(BlocklistConfig::default())
    }

    #[test]
    fn three_heavy_losses_block_then_cool_down() {
        let list = blocklist();
        let now = Utc::now();
        assert!(list.record_outcome("DOGEUSDT", dec!(-25), now).is_none());
        assert!(list.record_outcome("DOGEUSDT", dec!(-22), now).is_none());
        let block = list.record_outcome("DOGEUSDT", dec!(-30), now).unwrap();
        assert_eq!(block.cause, BlockCause::ConsecutiveLosses);
        assert_eq!(block.until, Some(now + Duration::minutes(120)));

        assert!(list.check("DOGEUSDT", now + Duration::minutes(60)).is_some());
        assert!(list.check("DOGEUSDT", now + Duration::minutes(121)).is_none());
    }

    #[test]
    fn repeat_offense_needs_manual_unblock() {
        let list = blocklist();
        let now = Utc::now();
        list.record_outcome("PEPEUSDT", dec!(-60), now);
        assert!(list.check("PEPEUSDT", now + Duration::hours(3)).is_none());

        let block = list.record_outcome("PEPEUSDT", dec!(-55), now + Duration::hours(3)).unwrap();
        assert_eq!(block.until, None);
        assert!(list.check("PEPEUSDT", now + Duration::days(30)).is_some());

        assert!(list.unblock("PEPEUSDT"));
        assert!(list.check("PEPEUSDT", now + Duration::days(30)).is_none());
        assert!(!list.unblock("PEPEUSDT"));
    }

    #[test]
    fn a_win_breaks_the_streak() {
        let list = blocklist();
        let now = Utc::now();
        list.record_outcome("SOLUSDT", dec!(-25), now);
        list.record_outcome("SOLUSDT", dec!(-25), now);
        list.record_outcome("SOLUSDT", dec!(5), now);
        assert!(list.record_outcome("SOLUSDT", dec!(-25), now).is_none());
    }

    #[test]
    fn shallow_third_loss_does_not_block() {
        let list = blocklist();
        let now = Utc::now();
        list.record_outcome("ADAUSDT", dec!(-30), now);
        list.record_outcome("ADAUSDT", dec!(-30), now);
        assert!(list.record_outcome("ADAUSDT", dec!(-5), now).is_none());
    }

    #[test]
    fn reset_history_forgets_offenses() {
        let list = blocklist();
        let now = Utc::now();
        list.record_outcome("XRPUSDT", dec!(-80), now);
        list.reset_history("XRPUSDT");
        let block = list.record_outcome("XRPUSDT", dec!(-80), now).unwrap();
        assert_eq!(block.offenses, 1);
        assert!(block.until.is_some());
        assert_eq!(list.blocked(now).len(), 1);
    }
}
