//! Domain types with no I/O: modes, positions, protection state, proposals.

pub mod close;
pub mod instrument;
pub mod mode;
pub mod position;
pub mod proposal;
pub mod protection;

pub use close::CloseReason;
pub use instrument::InstrumentRules;
pub use mode::TradingMode;
pub use position::{
    LevelStatus, NewPosition, OrderSide, Position, Provenance, Side, StagedEntry, StagedFill,
    TakeProfitLevel, TrailingParams,
};
pub use proposal::{EntryType, ProposalAction, TradeProposal};
pub use protection::{ProtectionState, ProtectionStateMachine, ProtectionStatus, TransitionError};
