//! Minimal progress snapshots of open positions.
//!
//! Written after protection-relevant events (entry, TP hit, stop move) and
//! read back when reconciliation rediscovers a position after a restart, so
//! a restart never resets TP progress to the first level.
//!
//! The file is a JSON object keyed by symbol, replaced atomically
//! (write to a sibling temp file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PersistenceError;
use crate::domain::{Position, Side, StagedEntry, TradingMode};

/// Progress of one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionProgress {
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Mode.
    pub mode: TradingMode,
    /// Take-profit levels already hit (they are hit in order).
    pub levels_hit: usize,
    /// Stop price at save time.
    pub stop_price: Decimal,
    /// Breakeven applied.
    pub breakeven_applied: bool,
    /// Trailing armed.
    pub trailing_active: bool,
    /// Best price seen.
    pub watermark: Decimal,
    /// Original quantity.
    pub original_qty: Decimal,
    /// Progressive entry sub-state.
    #[serde(default)]
    pub staged: Option<StagedEntry>,
    /// Save time.
    pub saved_at: DateTime<Utc>,
}

impl PositionProgress {
    /// Capture a position's progress.
    #[must_use]
    pub fn from_position(position: &Position) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            mode: position.mode,
            levels_hit: position.levels_hit(),
            stop_price: position.stop_price(),
            breakeven_applied: position.breakeven_applied,
            trailing_active: position.trailing_active,
            watermark: position.watermark,
            original_qty: position.original_qty,
            staged: position.staged.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Restore progress onto a freshly rebuilt position. The stop only moves
    /// if the saved one is tighter. Returns `false` (and changes nothing)
    /// when the side differs, i.e. the snapshot belongs to an older trade.
    pub fn apply_to(&self, position: &mut Position) -> bool {
        if self.side != position.side || self.symbol != position.symbol {
            return false;
        }
        position.mode = self.mode;
        for index in 0..self.levels_hit.min(position.take_profits.len()) {
            position.mark_level_hit(index);
        }
        position.tighten_stop(self.stop_price);
        position.breakeven_applied |= self.breakeven_applied;
        position.trailing_active |= self.trailing_active;
        position.update_watermark(self.watermark);
        if self.original_qty > position.original_qty {
            position.original_qty = self.original_qty;
        }
        if position.staged.is_none() {
            position.staged.clone_from(&self.staged);
        }
        true
    }
}

/// Snapshot file, or an in-memory stand-in when no path is configured.
#[derive(Debug)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, PositionProgress>>,
}

impl SnapshotStore {
    /// Store without a backing file.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or start) the snapshot file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(PersistenceError::io(path, e)),
        };
        tracing::info!(path = %path.display(), positions = entries.len(), "Loaded position snapshots");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Record a position's current progress.
    pub fn save(&self, position: &Position) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        entries.insert(
            position.symbol.clone(),
            PositionProgress::from_position(position),
        );
        self.flush(&entries)
    }

    /// Drop a closed position's snapshot.
    pub fn remove(&self, symbol: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        if entries.remove(symbol).is_none() {
            return Ok(());
        }
        self.flush(&entries)
    }

    /// Saved progress for `symbol`.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<PositionProgress> {
        self.entries.lock().get(symbol).cloned()
    }

    /// Number of saved positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Nothing saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn flush(&self, entries: &BTreeMap<String, PositionProgress>) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| PersistenceError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewPosition, Provenance, TakeProfitLevel, TrailingParams};
    use rust_decimal_macros::dec;

    fn position(side: Side) -> Position {
        Position::open(
            NewPosition {
                symbol: "ETHUSDT".to_string(),
                side,
                mode: TradingMode::Swing,
                entry_price: dec!(2000),
                quantity: dec!(1),
                leverage: 5,
                stop_price: dec!(1960),
                take_profits: vec![
                    TakeProfitLevel::pending(dec!(2060), dec!(50), dec!(3)),
                    TakeProfitLevel::pending(dec!(2120), dec!(50), dec!(6)),
                ],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        )
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let mut p = position(Side::Long);
        p.mark_level_hit(0);
        p.apply_breakeven(dec!(2002));
        {
            let store = SnapshotStore::open(&path).unwrap();
            store.save(&p).unwrap();
        }

        let store = SnapshotStore::open(&path).unwrap();
        let progress = store.get("ETHUSDT").unwrap();
        assert_eq!(progress.levels_hit, 1);
        assert_eq!(progress.stop_price, dec!(2002));

        store.remove("ETHUSDT").unwrap();
        assert!(SnapshotStore::open(&path).unwrap().is_empty());
    }

    #[test]
    fn restores_progress_onto_rebuilt_position() {
        let mut original = position(Side::Long);
        original.mark_level_hit(0);
        original.apply_breakeven(dec!(2002));
        original.update_watermark(dec!(2080));
        let progress = PositionProgress::from_position(&original);

        let mut rebuilt = position(Side::Long);
        rebuilt.mode = TradingMode::Scalp;
        assert!(progress.apply_to(&mut rebuilt));
        assert_eq!(rebuilt.mode, TradingMode::Swing);
        assert_eq!(rebuilt.levels_hit(), 1);
        assert_eq!(rebuilt.stop_price(), dec!(2002));
        assert!(rebuilt.breakeven_applied);
        assert_eq!(rebuilt.watermark, dec!(2080));
    }

    #[test]
    fn ignores_snapshot_from_the_other_side() {
        let progress = PositionProgress::from_position(&position(Side::Short));
        let mut rebuilt = position(Side::Long);
        assert!(!progress.apply_to(&mut rebuilt));
        assert_eq!(rebuilt.levels_hit(), 0);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SnapshotStore::open(&path),
            Err(PersistenceError::Serialization(_))
        ));
    }
}
