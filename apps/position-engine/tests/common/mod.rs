//! Shared setup for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use position_engine::config::Config;
use position_engine::gateway::{ExchangePosition, RetryPolicy};
use position_engine::{
    Engine, InMemoryTradeJournal, OpenOutcome, ProposalAction, Side, SimulatedExchange, SnapshotStore,
    TradeProposal, TradingMode,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Engine wired to a simulated exchange with an in-memory journal.
pub struct TestEngine {
    pub exchange: Arc<SimulatedExchange>,
    pub journal: Arc<InMemoryTradeJournal>,
    pub engine: Engine,
}

/// Defaults with instant retries and fill polling.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryPolicy::immediate(3);
    config.entry.fill_poll_interval_ms = 0;
    config.protection.placement_grace_secs = 0;
    config
}

pub fn engine_with(config: Config) -> TestEngine {
    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_mark_price("BTCUSDT", dec!(100));
    exchange.set_mark_price("ETHUSDT", dec!(100));
    exchange.set_mark_price("SOLUSDT", dec!(50));
    let journal = Arc::new(InMemoryTradeJournal::new());
    let engine = Engine::new(
        config,
        exchange.clone(),
        journal.clone(),
        Arc::new(SnapshotStore::in_memory()),
    )
    .unwrap();
    TestEngine {
        exchange,
        journal,
        engine,
    }
}

pub fn engine() -> TestEngine {
    engine_with(fast_config())
}

pub fn long(symbol: &str) -> TradeProposal {
    TradeProposal::market(symbol, ProposalAction::Long, TradingMode::Swing, dec!(0.5))
}

pub async fn open(t: &TestEngine, proposal: TradeProposal) {
    let outcome = t.engine.submit(proposal).await.unwrap();
    assert!(matches!(outcome, OpenOutcome::Opened(_)), "{outcome:?}");
}

pub fn exchange_long(symbol: &str, quantity: Decimal, entry: Decimal) -> ExchangePosition {
    ExchangePosition {
        symbol: symbol.to_string(),
        side: Side::Long,
        quantity,
        entry_price: entry,
        mark_price: entry,
        leverage: 5,
        unrealized_pnl: Decimal::ZERO,
    }
}
