//! Closed-trade journal.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PersistenceError;
use crate::domain::{CloseReason, Provenance, Side, TradingMode};

/// One closed position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTradeRecord {
    /// Symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Mode at close.
    pub mode: TradingMode,
    /// Quantity closed by the final exit.
    pub quantity: Decimal,
    /// Entry price.
    pub entry_price: Decimal,
    /// Exit price (zero when it could not be recovered).
    pub exit_price: Decimal,
    /// Realized PnL over the whole position, net of fees.
    pub realized_pnl: Decimal,
    /// Leveraged ROI on the initial margin, percent.
    pub roi_pct: Decimal,
    /// Why it closed.
    pub reason: CloseReason,
    /// Where it came from.
    pub provenance: Provenance,
    /// Entry time.
    pub opened_at: DateTime<Utc>,
    /// Close time.
    pub closed_at: DateTime<Utc>,
}

/// Sink for closed-trade records.
pub trait TradeJournal: Send + Sync {
    /// Append a record.
    fn record(&self, trade: &ClosedTradeRecord) -> Result<(), PersistenceError>;
}

/// Journal kept in memory; used in paper mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryTradeJournal {
    trades: Mutex<Vec<ClosedTradeRecord>>,
}

impl InMemoryTradeJournal {
    /// Empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record so far.
    #[must_use]
    pub fn trades(&self) -> Vec<ClosedTradeRecord> {
        self.trades.lock().clone()
    }
}

impl TradeJournal for InMemoryTradeJournal {
    fn record(&self, trade: &ClosedTradeRecord) -> Result<(), PersistenceError> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }
}

/// Append-only JSON-lines journal.
#[derive(Debug)]
pub struct JsonlTradeJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTradeJournal {
    /// Journal appending to `path`; the file is created on first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Read every record back.
    pub fn read_all(&self) -> Result<Vec<ClosedTradeRecord>, PersistenceError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PersistenceError::from))
            .collect()
    }
}

impl TradeJournal for JsonlTradeJournal {
    fn record(&self, trade: &ClosedTradeRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(trade)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.write_all(&line)
            .map_err(|e| PersistenceError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(symbol: &str, pnl: Decimal) -> ClosedTradeRecord {
        ClosedTradeRecord {
            symbol: symbol.to_string(),
            side: Side::Short,
            mode: TradingMode::Scalp,
            quantity: dec!(0.5),
            entry_price: dec!(3000),
            exit_price: dec!(2990),
            realized_pnl: pnl,
            roi_pct: dec!(3.3),
            reason: CloseReason::TakeProfit,
            provenance: Provenance::Signal,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn jsonl_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");

        JsonlTradeJournal::new(&path).record(&trade("ETHUSDT", dec!(5))).unwrap();
        let journal = JsonlTradeJournal::new(&path);
        journal.record(&trade("BTCUSDT", dec!(-2))).unwrap();

        let all = journal.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol, "ETHUSDT");
        assert_eq!(all[1].realized_pnl, dec!(-2));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlTradeJournal::new(dir.path().join("none.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn in_memory_keeps_order() {
        let journal = InMemoryTradeJournal::new();
        journal.record(&trade("A", dec!(1))).unwrap();
        journal.record(&trade("B", dec!(2))).unwrap();
        let symbols: Vec<_> = journal.trades().into_iter().map(|t| t.symbol).collect();
        assert_eq!(symbols, vec!["A", "B"]);
    }
}
