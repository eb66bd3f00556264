//! Crate-level error type.
//!
//! Each subsystem has its own error enum; [`EngineError`] wraps them for
//! callers of the [`Engine`](crate::runtime::Engine) facade.
//!
//! | Variant       | Source                     | Typical cause                         |
//! |---------------|----------------------------|---------------------------------------|
//! | `Config`      | [`ConfigError`]            | bad YAML, failed validation           |
//! | `Gateway`     | [`GatewayError`]           | exchange unreachable, order refused   |
//! | `Persistence` | [`PersistenceError`]       | snapshot or journal I/O               |
//! | `Execution`   | [`ExecutionError`]         | unconfirmed fill, unknown position    |
//! | `Protection`  | [`ProtectionError`]        | protective order placement exhausted  |
//! | `Transition`  | [`TransitionError`]        | illegal protection state change       |

use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::TransitionError;
use crate::execution::ExecutionError;
use crate::gateway::{ErrorCategory, GatewayError};
use crate::persistence::PersistenceError;
use crate::protection::ProtectionError;

/// Any failure surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Exchange call failed.
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    /// Snapshot or journal failure.
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    /// Entry or exit failed.
    #[error("execution: {0}")]
    Execution(#[from] ExecutionError),

    /// Protective order handling failed.
    #[error("protection: {0}")]
    Protection(#[from] ProtectionError),

    /// Protection state machine refused a transition.
    #[error("protection state: {0}")]
    Transition(#[from] TransitionError),
}

impl EngineError {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Gateway(_) => "gateway",
            Self::Persistence(_) => "persistence",
            Self::Execution(_) => "execution",
            Self::Protection(_) => "protection",
            Self::Transition(_) => "transition",
        }
    }

    /// The underlying exchange failure is worth retrying later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let gateway = match self {
            Self::Gateway(e) | Self::Execution(ExecutionError::Gateway(e)) => e,
            _ => return false,
        };
        !matches!(gateway.category(), ErrorCategory::NonRetryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProtectionState;

    #[test]
    fn wraps_subsystem_errors() {
        let err: EngineError = GatewayError::Timeout.into();
        assert_eq!(err.kind(), "gateway");
        assert!(err.is_transient());

        let err: EngineError = ExecutionError::PositionNotFound {
            symbol: "BTCUSDT".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "execution");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "execution: no open position for BTCUSDT");

        let err: EngineError = TransitionError {
            from: ProtectionState::Emergency,
            to: ProtectionState::Protected,
            reason: "terminal".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "transition");
    }

    #[test]
    fn rejected_orders_are_not_transient() {
        let err = EngineError::Execution(ExecutionError::Gateway(GatewayError::OrderRejected {
            reason: "reduce only".to_string(),
        }));
        assert!(!err.is_transient());
        assert!(EngineError::Gateway(GatewayError::RateLimited).is_transient());
    }
}
