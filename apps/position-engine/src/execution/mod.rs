//! Entry and exit execution.
//!
//! The [`ExecutionController`] is the only component that opens or closes
//! positions. Every other loop (price monitor, guardian, reconciliation)
//! asks it to act, so the gate order, fill verification and close
//! bookkeeping live in one place.
//!
//! ```text
//! proposal ─► directional? ─► mode enabled? ─► claim symbol ─► balance
//!          ─► size ─► funding ─► lot rounding ─► RiskGate ─► order
//!          ─► verify fill ─► commit to registry ─► establish protection
//! ```

pub mod advisory;
pub mod controller;
pub mod funding;
pub mod ledger;
pub mod pending;
pub mod sizing;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::{CloseReason, ProtectionState, Side, TradingMode};
use crate::gateway::GatewayError;
use crate::protection::ProtectionError;
use crate::risk::RejectReason;

pub use advisory::{
    AdvisoryError, AdvisoryPort, AdvisoryRejection, SlUpdateHistory, SlUpdateRecord,
    validate_stop_update,
};
pub use controller::ExecutionController;
pub use funding::{FundingDecision, assess_entry, should_exit_before_funding};
pub use ledger::{CloseLedger, ExitSettlement, RecoveredExit, recover_exit};
pub use pending::{PendingEntry, PendingEntryBook, PendingResolution};
pub use sizing::PositionSizer;

/// Execution failure. Business rejections are not errors; see [`OpenOutcome::Rejected`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Exchange call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Protective order handling failed.
    #[error(transparent)]
    Protection(#[from] ProtectionError),

    /// A market entry was accepted but its fill never confirmed.
    #[error("fill for {symbol} order {order_id} not confirmed")]
    FillUnconfirmed {
        /// Symbol.
        symbol: String,
        /// Entry order id.
        order_id: String,
    },

    /// An exit order did not fill.
    #[error("exit for {symbol} order {order_id} not filled")]
    ExitUnfilled {
        /// Symbol.
        symbol: String,
        /// Exit order id.
        order_id: String,
    },

    /// No tracked position for the symbol.
    #[error("no open position for {symbol}")]
    PositionNotFound {
        /// Symbol.
        symbol: String,
    },

    /// Target mode does not accept positions.
    #[error("mode {mode} is disabled")]
    ModeDisabled {
        /// Mode.
        mode: TradingMode,
    },
}

/// A position opened and committed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenReport {
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Mode.
    pub mode: TradingMode,
    /// Filled quantity.
    pub quantity: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Initial stop.
    pub stop_price: Decimal,
    /// Take-profit ladder prices.
    pub targets: Vec<Decimal>,
    /// Protection reached right after entry; `None` when placement failed
    /// and the guardian took over.
    pub protection: Option<ProtectionState>,
}

/// Result of [`ExecutionController::open_position`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Filled and tracked.
    Opened(OpenReport),
    /// Limit order resting; tracked as a pending entry.
    Pending {
        /// Entry order id.
        order_id: String,
    },
    /// Refused by a gate.
    Rejected(RejectReason),
}

impl OpenOutcome {
    /// The position is open.
    #[must_use]
    pub const fn is_opened(&self) -> bool {
        matches!(self, Self::Opened(_))
    }
}

/// A completed exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    /// Symbol.
    pub symbol: String,
    /// Why it closed.
    pub reason: CloseReason,
    /// Quantity closed by this exit.
    pub quantity: Decimal,
    /// Exit price.
    pub exit_price: Decimal,
    /// Realized PnL over the whole position, net of fees.
    pub realized_pnl: Decimal,
    /// Leveraged ROI on the initial margin, percent.
    pub roi_pct: Decimal,
}

/// Result of [`ExecutionController::close_position`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Position removed.
    Closed(CloseReport),
    /// Exit filled only in part; the remainder stays open and protected.
    Partial {
        /// Quantity closed.
        closed: Decimal,
        /// Quantity still open.
        remaining: Decimal,
    },
    /// Position gone or another close in flight; nothing done.
    Skipped,
}

/// Result of an advisory stop update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopUpdate {
    /// Stop moved to the given price.
    Applied {
        /// New stop.
        stop: Decimal,
    },
    /// A rule rejected the proposal.
    Rejected(AdvisoryRejection),
    /// The position is gone or closing.
    Skipped,
}

/// Outcome of one pending-entry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSweepReport {
    /// Entries that became positions.
    pub opened: Vec<String>,
    /// Entries cancelled at their deadline or dropped by the venue.
    pub cancelled: Vec<String>,
    /// Entries still resting.
    pub waiting: usize,
}
