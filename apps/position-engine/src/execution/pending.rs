//! Resting limit entries awaiting a fill.
//!
//! A pending entry holds the symbol claim and the reserved margin, so no
//! other entry (and no reconciliation adoption) can race it. Dropping the
//! entry releases both.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{Side, TradeProposal};
use crate::gateway::{OrderSnapshot, OrderStatus};
use crate::registry::ClaimGuard;
use crate::risk::AllocationReservation;

/// A placed, not yet filled limit entry.
#[derive(Debug)]
pub struct PendingEntry {
    /// Exchange order id.
    pub order_id: String,
    /// Proposal that produced the order.
    pub proposal: TradeProposal,
    /// Direction.
    pub side: Side,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Limit price.
    pub limit_price: Decimal,
    /// Leverage.
    pub leverage: u32,
    /// Placement time.
    pub placed_at: DateTime<Utc>,
    /// Cancel deadline.
    pub deadline: DateTime<Utc>,
    claim: ClaimGuard,
    reservation: AllocationReservation,
}

impl PendingEntry {
    /// Track a freshly placed limit entry.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: String,
        proposal: TradeProposal,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
        leverage: u32,
        placed_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        claim: ClaimGuard,
        reservation: AllocationReservation,
    ) -> Self {
        Self {
            order_id,
            proposal,
            side,
            quantity,
            limit_price,
            leverage,
            placed_at,
            deadline,
            claim,
            reservation,
        }
    }

    /// Symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        self.claim.symbol()
    }

    /// Margin held for the entry.
    #[must_use]
    pub const fn reserved_margin(&self) -> Decimal {
        self.reservation.margin()
    }

    /// Proposal, claim and reservation, for committing the filled position.
    #[must_use]
    pub fn into_parts(self) -> (TradeProposal, ClaimGuard, AllocationReservation) {
        (self.proposal, self.claim, self.reservation)
    }
}

/// What to do with a pending entry after looking at its order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingResolution {
    /// Still resting, deadline not reached.
    Wait,
    /// Fully filled.
    Filled {
        /// Filled quantity.
        quantity: Decimal,
        /// Average fill price.
        price: Decimal,
    },
    /// Deadline passed with enough filled to keep; cancel the rest.
    AcceptPartial {
        /// Filled quantity.
        quantity: Decimal,
        /// Average fill price.
        price: Decimal,
    },
    /// Deadline passed (or the venue dropped the order); cancel and forget.
    Cancel {
        /// Quantity filled before cancelling, left for reconciliation.
        filled: Decimal,
    },
}

/// Decide a pending entry's fate from its order snapshot.
#[must_use]
pub fn resolve(
    order: &OrderSnapshot,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
    partial_completion_pct: Decimal,
) -> PendingResolution {
    let price = order.avg_price.or(order.price).unwrap_or_default();
    if order.status == OrderStatus::Filled && order.filled_qty > Decimal::ZERO {
        return PendingResolution::Filled {
            quantity: order.filled_qty,
            price,
        };
    }

    let dead = !order.status.is_open();
    if !dead && now < deadline {
        return PendingResolution::Wait;
    }

    let completion = if order.quantity.is_zero() {
        Decimal::ZERO
    } else {
        order.filled_qty / order.quantity * dec!(100)
    };
    if order.filled_qty > Decimal::ZERO && completion >= partial_completion_pct {
        PendingResolution::AcceptPartial {
            quantity: order.filled_qty,
            price,
        }
    } else {
        PendingResolution::Cancel {
            filled: order.filled_qty,
        }
    }
}

/// Pending limit entries keyed by symbol.
#[derive(Debug, Default)]
pub struct PendingEntryBook {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingEntryBook {
    /// Empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an entry.
    pub fn insert(&self, entry: PendingEntry) {
        self.entries.lock().insert(entry.symbol().to_string(), entry);
    }

    /// Stop tracking `symbol`, returning its entry.
    pub fn take(&self, symbol: &str) -> Option<PendingEntry> {
        self.entries.lock().remove(symbol)
    }

    /// `(symbol, order_id, deadline)` of every entry.
    #[must_use]
    pub fn outstanding(&self) -> Vec<(String, String, DateTime<Utc>)> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .values()
            .map(|e| (e.symbol().to_string(), e.order_id.clone(), e.deadline))
            .collect();
        all.sort();
        all
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// No pending entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
