//! Protective orders and the guardian that keeps them alive.
//!
//! # Architecture
//!
//! ```text
//! ProtectionGuardian (every guardian_interval)
//!     │
//!     ├── open_orders(symbol) ──► stop live? target live?
//!     │
//!     ├── stop live, target missing ──► ProtectiveOrders::restore_target
//!     │
//!     ├── stop missing ──► Unprotected ──► Healing ──► ProtectiveOrders::establish
//!     │
//!     └── heal budget or unprotected time exhausted ──► Emergency ──► EmergencyCloser
//! ```

pub mod guardian;
pub mod orders;

use thiserror::Error;

use crate::domain::TransitionError;
use crate::gateway::GatewayError;

pub use guardian::{EmergencyCloser, GuardianReport, ProtectionGuardian};
pub use orders::ProtectiveOrders;

/// Protection failures.
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// The position disappeared while orders were in flight.
    #[error("position {symbol} no longer tracked")]
    PositionGone {
        /// Symbol.
        symbol: String,
    },

    /// The remaining quantity cannot form a valid order.
    #[error("position {symbol} is dust ({quantity})")]
    Dust {
        /// Symbol.
        symbol: String,
        /// Remaining quantity.
        quantity: rust_decimal::Decimal,
    },

    /// A protective order could not be placed after retries.
    #[error("failed to place protective order for {symbol}: {source}")]
    Placement {
        /// Symbol.
        symbol: String,
        /// Last gateway error.
        #[source]
        source: GatewayError,
    },

    /// Invalid protection state transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Gateway failure outside placement.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
