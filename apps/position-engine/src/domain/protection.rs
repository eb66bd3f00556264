//! Protection state machine.
//!
//! Tracks whether a position's protective orders actually exist on the
//! exchange.
//!
//! ```text
//! Opening → PlacingStop → StopVerified → PlacingTarget → Protected
//!     any verification failure → Unprotected
//!     Unprotected → Healing → StopVerified / Protected
//!     too many heal attempts or too long unprotected → Emergency (terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protection state of a single position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionState {
    /// Position just filled, nothing placed yet.
    Opening,
    /// Stop-loss placement in flight.
    PlacingStop,
    /// Stop-loss confirmed on the exchange.
    StopVerified,
    /// Take-profit placement in flight.
    PlacingTarget,
    /// Stop-loss and take-profit both confirmed.
    Protected,
    /// Repair attempt in flight.
    Healing,
    /// Stop-loss missing on the exchange.
    Unprotected,
    /// Protection could not be restored; the position is being force-closed.
    Emergency,
}

impl ProtectionState {
    /// A placement or repair is in flight for this state.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Opening | Self::PlacingStop | Self::PlacingTarget | Self::Healing)
    }

    /// Terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Emergency)
    }
}

impl std::fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Opening => "OPENING",
            Self::PlacingStop => "PLACING_STOP",
            Self::StopVerified => "STOP_VERIFIED",
            Self::PlacingTarget => "PLACING_TARGET",
            Self::Protected => "PROTECTED",
            Self::Healing => "HEALING",
            Self::Unprotected => "UNPROTECTED",
            Self::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

/// Rejected protection state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid protection transition {from} -> {to}: {reason}")]
pub struct TransitionError {
    /// Current state.
    pub from: ProtectionState,
    /// Requested state.
    pub to: ProtectionState,
    /// Human-readable reason.
    pub reason: String,
}

/// Validates protection state transitions.
pub struct ProtectionStateMachine;

impl ProtectionStateMachine {
    /// Check if a state transition is valid.
    #[must_use]
    pub fn is_valid_transition(from: ProtectionState, to: ProtectionState) -> bool {
        use ProtectionState::{
            Emergency, Healing, Opening, PlacingStop, PlacingTarget, Protected, StopVerified,
            Unprotected,
        };

        if from == Emergency {
            return false;
        }
        if to == Emergency || to == Unprotected {
            return from != Unprotected || to == Emergency;
        }

        matches!(
            (from, to),
            (Opening, PlacingStop)
                | (PlacingStop, StopVerified)
                | (StopVerified, PlacingTarget)
                | (StopVerified, Protected)
                | (PlacingTarget, Protected)
                | (PlacingTarget, StopVerified)
                // Target went missing while the stop is still live
                | (Protected, StopVerified)
                | (Protected, PlacingTarget)
                // Explicit re-arm (mode conversion)
                | (StopVerified, PlacingStop)
                | (Protected, PlacingStop)
                // Repair path
                | (Unprotected, Healing)
                | (Healing, StopVerified)
                | (Healing, Protected)
        )
    }

    /// Validate a state transition.
    pub fn validate_transition(
        from: ProtectionState,
        to: ProtectionState,
    ) -> Result<(), TransitionError> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            let reason = if from.is_terminal() {
                format!("{from} is terminal")
            } else {
                format!("{to} is not reachable from {from}")
            };
            Err(TransitionError { from, to, reason })
        }
    }
}

/// Verification bookkeeping attached to every position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionStatus {
    state: ProtectionState,
    /// Stop-loss order confirmed live.
    pub stop_verified: bool,
    /// When the stop-loss was last confirmed.
    pub stop_verified_at: Option<DateTime<Utc>>,
    /// Take-profit order confirmed live.
    pub target_verified: bool,
    /// When the take-profit was last confirmed.
    pub target_verified_at: Option<DateTime<Utc>>,
    /// Placement or verification failures since the position opened.
    pub failure_count: u32,
    /// Repair attempts since protection was last fully established.
    pub heal_attempts: u32,
    /// When the state last changed.
    pub last_state_change: DateTime<Utc>,
    /// When the stop was first found missing, cleared on repair.
    pub unprotected_since: Option<DateTime<Utc>>,
    /// Remaining quantity cannot form a valid order; excluded from placement.
    pub dust: bool,
}

impl ProtectionStatus {
    /// Fresh status for a position that just opened.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: ProtectionState::Opening,
            stop_verified: false,
            stop_verified_at: None,
            target_verified: false,
            target_verified_at: None,
            failure_count: 0,
            heal_attempts: 0,
            last_state_change: now,
            unprotected_since: None,
            dust: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ProtectionState {
        self.state
    }

    /// Move to `to`, validating the transition. Same-state requests are no-ops.
    pub fn transition(
        &mut self,
        to: ProtectionState,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.state == to {
            return Ok(());
        }
        ProtectionStateMachine::validate_transition(self.state, to)?;

        match to {
            ProtectionState::Unprotected => {
                self.stop_verified = false;
                self.unprotected_since.get_or_insert(now);
            }
            ProtectionState::Healing => self.heal_attempts += 1,
            ProtectionState::StopVerified => self.unprotected_since = None,
            ProtectionState::Protected => {
                self.unprotected_since = None;
                self.heal_attempts = 0;
            }
            _ => {}
        }

        self.state = to;
        self.last_state_change = now;
        Ok(())
    }

    /// Record that the stop order was seen live.
    pub fn mark_stop_verified(&mut self, now: DateTime<Utc>) {
        self.stop_verified = true;
        self.stop_verified_at = Some(now);
    }

    /// Record that the take-profit order was seen live.
    pub fn mark_target_verified(&mut self, now: DateTime<Utc>) {
        self.target_verified = true;
        self.target_verified_at = Some(now);
    }

    /// Record that the take-profit order is gone.
    pub const fn mark_target_missing(&mut self) {
        self.target_verified = false;
    }

    /// Record that the stop order is gone. Moves to `Unprotected` unless the
    /// position is already unprotected or in emergency.
    pub fn mark_stop_missing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.failure_count += 1;
        self.stop_verified = false;
        if matches!(self.state, ProtectionState::Unprotected | ProtectionState::Emergency) {
            self.unprotected_since.get_or_insert(now);
            return Ok(());
        }
        self.transition(ProtectionState::Unprotected, now)
    }

    /// How long the stop has been missing.
    #[must_use]
    pub fn unprotected_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.unprotected_since.map(|since| now - since)
    }
}
