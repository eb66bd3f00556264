// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Position Engine - Rust Core Library
//!
//! Lifecycle engine for leveraged perpetual-futures positions: gated entry,
//! exchange-side protection, TP ladder / breakeven / trailing management,
//! and continuous reconciliation against the exchange.
//!
//! # Architecture
//!
//! - **Domain** (`domain`): positions, trading modes, the protection state
//!   machine and trade proposals. No I/O.
//! - **Ports** (`gateway`, `persistence`, `execution::AdvisoryPort`): the
//!   exchange, snapshot/journal storage and the stop-loss advisor.
//!   `SimulatedExchange` implements the exchange for paper trading and tests.
//! - **State** (`registry`): every tracked position behind one lock. Callers
//!   snapshot, release, call the exchange, then re-check under the lock.
//! - **Services**:
//!   - `risk`: capital allocation, circuit breakers, instrument blocklist
//!   - `execution`: the controller that opens, reduces and closes positions
//!   - `tpsl`: per-tick stop/target/trailing evaluation
//!   - `protection`: protective order placement and the guardian
//!   - `reconciliation`: exchange-truth reconciliation and orphan sweep
//! - **Runtime** (`runtime`): the `Engine` facade and its supervised loops.
//!
//! # Invariants
//!
//! - `0 <= remaining_qty <= original_qty` after every mutation.
//! - Stops only tighten, except the breakeven transition and mode conversion.
//! - At most one exit executes per symbol at a time.
//! - Two reconciliation passes with no exchange change in between mutate
//!   nothing the second time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// YAML configuration, env interpolation and validation.
pub mod config;

/// Pure domain types.
pub mod domain;

/// Crate-level error type.
pub mod error;

/// Entry and exit execution.
pub mod execution;

/// Exchange port, retry policy and the simulated exchange.
pub mod gateway;

/// Tracing and metrics.
pub mod observability;

/// Progress snapshots and the closed-trade journal.
pub mod persistence;

/// Protective orders and the guardian.
pub mod protection;

/// Registry/exchange reconciliation.
pub mod reconciliation;

/// Single-lock position registry.
pub mod registry;

/// Capital allocation, circuit breakers and the blocklist.
pub mod risk;

/// Engine wiring and supervised background tasks.
pub mod runtime;

/// TP/SL/trailing evaluation.
pub mod tpsl;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{Config, ConfigError, load_config, load_config_from_string};
pub use domain::{
    CloseReason, Position, ProposalAction, ProtectionState, Side, TradeProposal, TradingMode,
};
pub use error::EngineError;
pub use execution::{CloseOutcome, ExecutionController, ExecutionError, OpenOutcome};
pub use gateway::{GatewayError, OrderGateway, SimulatedExchange};
pub use persistence::{InMemoryTradeJournal, JsonlTradeJournal, SnapshotStore, TradeJournal};
pub use registry::PositionRegistry;
pub use runtime::{Engine, StatusReport};
