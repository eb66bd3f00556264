//! Trading modes and their specialization table.

use serde::{Deserialize, Serialize};

/// A named trading style with its own sizing, SL/TP and breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Seconds-to-minutes holds with a hard maximum hold time.
    UltraFast,
    /// Short intraday moves.
    Scalp,
    /// Re-entry after a scalp exit. Shares the scalp budget and breakers.
    ScalpReentry,
    /// Multi-hour to multi-day holds.
    Swing,
    /// Multi-day to multi-week holds.
    Position,
}

/// Specialization modes and the base mode whose capital budget and
/// circuit breakers they share.
const SPECIALIZATIONS: &[(TradingMode, TradingMode)] =
    &[(TradingMode::ScalpReentry, TradingMode::Scalp)];

impl TradingMode {
    /// Every mode, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::UltraFast,
        Self::Scalp,
        Self::ScalpReentry,
        Self::Swing,
        Self::Position,
    ];

    /// The allocation / circuit-breaker bucket this mode belongs to.
    #[must_use]
    pub fn base_mode(self) -> Self {
        SPECIALIZATIONS
            .iter()
            .find(|(special, _)| *special == self)
            .map_or(self, |(_, base)| *base)
    }

    /// Whether this mode is folded into another mode for accounting.
    #[must_use]
    pub fn is_specialization(self) -> bool {
        self.base_mode() != self
    }

    /// Modes that own a capital budget (no specializations).
    pub fn base_modes() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(|m| !m.is_specialization())
    }

    /// Stable snake_case name used in logs, metrics and snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UltraFast => "ultra_fast",
            Self::Scalp => "scalp",
            Self::ScalpReentry => "scalp_reentry",
            Self::Swing => "swing",
            Self::Position => "position",
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown trading mode: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TradingMode::UltraFast, TradingMode::UltraFast)]
    #[test_case(TradingMode::Scalp, TradingMode::Scalp)]
    #[test_case(TradingMode::ScalpReentry, TradingMode::Scalp)]
    #[test_case(TradingMode::Swing, TradingMode::Swing)]
    #[test_case(TradingMode::Position, TradingMode::Position)]
    fn base_mode_folds_specializations(mode: TradingMode, expected: TradingMode) {
        assert_eq!(mode.base_mode(), expected);
    }

    #[test]
    fn base_modes_excludes_specializations() {
        let bases: Vec<_> = TradingMode::base_modes().collect();
        assert_eq!(bases.len(), 4);
        assert!(!bases.contains(&TradingMode::ScalpReentry));
    }

    #[test]
    fn parses_snake_case_names() {
        assert_eq!(
            "scalp_reentry".parse::<TradingMode>(),
            Ok(TradingMode::ScalpReentry)
        );
        assert!("daytrade".parse::<TradingMode>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TradingMode::UltraFast).unwrap();
        assert_eq!(json, "\"ultra_fast\"");
    }
}
