//! Position Registry.
//!
//! The authoritative in-memory map of open positions behind one coarse lock.
//! Callers never hold the lock across a gateway call: they take a snapshot,
//! release, call the exchange, then re-acquire through [`PositionRegistry::update`]
//! and re-check that the position still exists.
//!
//! Besides positions the registry tracks *claims*: a symbol whose entry is in
//! flight (market order being verified or limit order resting). A claimed
//! symbol cannot be claimed again and is skipped by reconciliation adoption.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::{Position, TradingMode};

#[derive(Debug, Default)]
struct Inner {
    positions: HashMap<String, Position>,
    claims: HashSet<String>,
}

/// Margin and count held by one allocation bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModeUsage {
    /// Open positions in the bucket.
    pub positions: usize,
    /// Margin held by the bucket's remaining quantity.
    pub margin: Decimal,
}

/// Single-lock position map.
#[derive(Debug, Default)]
pub struct PositionRegistry {
    inner: Mutex<Inner>,
}

impl PositionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().positions.len()
    }

    /// No open positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().positions.is_empty()
    }

    /// Copies of every position, ordered by symbol.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.inner.lock().positions.values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    /// Copy of one position.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().positions.get(symbol).cloned()
    }

    /// Whether `symbol` has an open position.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.inner.lock().positions.contains_key(symbol)
    }

    /// Insert unless the symbol is already tracked. Returns `false` on conflict.
    pub fn insert_if_absent(&self, position: Position) -> bool {
        let mut inner = self.inner.lock();
        if inner.positions.contains_key(&position.symbol) {
            return false;
        }
        inner.positions.insert(position.symbol.clone(), position);
        true
    }

    /// Mutate a position under the lock. Returns `None` if it no longer exists.
    pub fn update<R>(&self, symbol: &str, f: impl FnOnce(&mut Position) -> R) -> Option<R> {
        self.inner.lock().positions.get_mut(symbol).map(f)
    }

    /// Remove a position.
    pub fn remove(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().positions.remove(symbol)
    }

    /// Set the closing guard and return a snapshot for the exit.
    ///
    /// Returns `None` if the position is gone or another exit is in flight;
    /// the caller must then do nothing.
    pub fn begin_close(&self, symbol: &str) -> Option<Position> {
        let mut inner = self.inner.lock();
        let position = inner.positions.get_mut(symbol)?;
        position.begin_close().then(|| position.clone())
    }

    /// Clear the closing guard after an exit that left the position open.
    pub fn abort_close(&self, symbol: &str) {
        if let Some(position) = self.inner.lock().positions.get_mut(symbol) {
            position.end_close();
        }
    }

    /// Usage per allocation bucket (specializations folded into their base).
    #[must_use]
    pub fn usage_by_mode(&self) -> HashMap<TradingMode, ModeUsage> {
        let inner = self.inner.lock();
        let mut usage: HashMap<TradingMode, ModeUsage> = HashMap::new();
        for position in inner.positions.values() {
            let entry = usage.entry(position.mode.base_mode()).or_default();
            entry.positions += 1;
            entry.margin += position.margin();
        }
        usage
    }

    /// Usage of the bucket `mode` belongs to.
    #[must_use]
    pub fn usage_for(&self, mode: TradingMode) -> ModeUsage {
        self.usage_by_mode()
            .get(&mode.base_mode())
            .copied()
            .unwrap_or_default()
    }

    /// Claim `symbol` for an entry in flight. Fails if the symbol already has
    /// a position or another claim. The claim is released when the guard drops.
    #[must_use]
    pub fn try_claim(self: &Arc<Self>, symbol: &str) -> Option<ClaimGuard> {
        let mut inner = self.inner.lock();
        if inner.positions.contains_key(symbol) || !inner.claims.insert(symbol.to_string()) {
            return None;
        }
        Some(ClaimGuard {
            registry: Arc::clone(self),
            symbol: symbol.to_string(),
        })
    }

    /// Whether an entry is in flight for `symbol`.
    #[must_use]
    pub fn is_claimed(&self, symbol: &str) -> bool {
        self.inner.lock().claims.contains(symbol)
    }

    fn release_claim(&self, symbol: &str) {
        self.inner.lock().claims.remove(symbol);
    }
}

/// Exclusive right to open a position for one symbol.
#[derive(Debug)]
pub struct ClaimGuard {
    registry: Arc<PositionRegistry>,
    symbol: String,
}

impl ClaimGuard {
    /// Claimed symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Insert the position this claim was held for and release the claim.
    /// Returns `false` if the symbol was tracked in the meantime.
    pub fn commit(self, position: Position) -> bool {
        debug_assert_eq!(position.symbol, self.symbol);
        self.registry.insert_if_absent(position)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.registry.release_claim(&self.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewPosition, Provenance, Side, TrailingParams};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, mode: TradingMode) -> Position {
        Position::open(
            NewPosition {
                symbol: symbol.to_string(),
                side: Side::Long,
                mode,
                entry_price: dec!(100),
                quantity: dec!(6),
                leverage: 10,
                stop_price: dec!(98),
                take_profits: vec![],
                trailing: TrailingParams::disabled(),
                provenance: Provenance::Signal,
                custom_roi_target_pct: None,
                entry_fee: Decimal::ZERO,
            },
            Utc::now(),
        )
    }

    #[test]
    fn insert_if_absent_rejects_duplicates() {
        let registry = PositionRegistry::new();
        assert!(registry.insert_if_absent(position("BTCUSDT", TradingMode::Scalp)));
        assert!(!registry.insert_if_absent(position("BTCUSDT", TradingMode::Swing)));
        assert_eq!(registry.get("BTCUSDT").unwrap().mode, TradingMode::Scalp);
    }

    #[test]
    fn begin_close_is_exclusive() {
        let registry = PositionRegistry::new();
        registry.insert_if_absent(position("ETHUSDT", TradingMode::Scalp));
        assert!(registry.begin_close("ETHUSDT").is_some());
        assert!(registry.begin_close("ETHUSDT").is_none());
        registry.abort_close("ETHUSDT");
        assert!(registry.begin_close("ETHUSDT").is_some());
        assert!(registry.begin_close("SOLUSDT").is_none());
    }

    #[test]
    fn update_on_missing_symbol_is_none() {
        let registry = PositionRegistry::new();
        assert_eq!(registry.update("XRPUSDT", |p| p.remaining_qty()), None);
    }

    #[test]
    fn specializations_share_their_base_bucket() {
        let registry = PositionRegistry::new();
        registry.insert_if_absent(position("BTCUSDT", TradingMode::Scalp));
        registry.insert_if_absent(position("ETHUSDT", TradingMode::ScalpReentry));
        registry.insert_if_absent(position("SOLUSDT", TradingMode::Swing));

        let scalp = registry.usage_for(TradingMode::ScalpReentry);
        assert_eq!(scalp.positions, 2);
        assert_eq!(scalp.margin, dec!(120));
        assert_eq!(registry.usage_for(TradingMode::Swing).positions, 1);
        assert_eq!(registry.usage_for(TradingMode::Position), ModeUsage::default());
    }

    #[test]
    fn claims_release_on_drop() {
        let registry = Arc::new(PositionRegistry::new());
        let claim = registry.try_claim("BTCUSDT").unwrap();
        assert!(registry.is_claimed("BTCUSDT"));
        assert!(registry.try_claim("BTCUSDT").is_none());
        drop(claim);
        assert!(!registry.is_claimed("BTCUSDT"));
        assert!(registry.try_claim("BTCUSDT").is_some());
    }

    #[test]
    fn commit_inserts_and_releases() {
        let registry = Arc::new(PositionRegistry::new());
        let claim = registry.try_claim("BTCUSDT").unwrap();
        assert!(claim.commit(position("BTCUSDT", TradingMode::Scalp)));
        assert!(registry.contains("BTCUSDT"));
        assert!(!registry.is_claimed("BTCUSDT"));
        assert!(registry.try_claim("BTCUSDT").is_none());
    }
}
