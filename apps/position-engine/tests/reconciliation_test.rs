//! Reconciliation against exchange truth across several symbols and restarts.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{engine, exchange_long, fast_config, long, open};
use position_engine::gateway::OrderKind;
use position_engine::reconciliation::DiscrepancyKind;
use position_engine::{
    CloseReason, Engine, InMemoryTradeJournal, ProtectionState, Side, SimulatedExchange,
    SnapshotStore,
};
use rust_decimal_macros::dec;

#[tokio::test]
async fn mixed_drift_is_repaired_once() {
    let t = engine();
    open(&t, long("BTCUSDT")).await;
    open(&t, long("ETHUSDT")).await;
    let eth_qty = t.engine.controller().registry().get("ETHUSDT").unwrap().remaining_qty();

    // outside the engine: BTC closed, half of ETH sold, SOL bought
    t.exchange.set_mark_price("BTCUSDT", dec!(99));
    assert!(t.exchange.close_externally("BTCUSDT", Side::Long));
    t.exchange.set_position_quantity("ETHUSDT", Side::Long, eth_qty / dec!(2), None);
    t.exchange.inject_position(exchange_long("SOLUSDT", dec!(2), dec!(50)));

    let reconciler = t.engine.reconciler();
    let first = reconciler.run_once().await;
    assert!(first.errors.is_empty(), "{first:?}");
    assert_eq!(first.removed, vec!["BTCUSDT".to_string()]);
    assert_eq!(first.adjusted, vec!["ETHUSDT".to_string()]);
    assert_eq!(first.adopted, vec!["SOLUSDT".to_string()]);
    assert_eq!(first.count(DiscrepancyKind::ExternallyClosed), 1);
    assert_eq!(first.count(DiscrepancyKind::MissedPartialClose), 1);
    assert_eq!(first.count(DiscrepancyKind::Untracked), 1);

    let registry = t.engine.controller().registry();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get("ETHUSDT").unwrap().remaining_qty(), eth_qty / dec!(2));
    let trades = t.journal.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].symbol, "BTCUSDT");
    assert_eq!(trades[0].reason, CloseReason::External);

    // nothing changed on the exchange: nothing to do
    let second = reconciler.run_once().await;
    assert_eq!(second.mutations(), 0, "{second:?}");
    assert!(second.is_clean(), "{second:?}");

    // a guardian pass in between does not create drift either
    t.engine.guardian().run_once().await;
    let third = reconciler.run_once().await;
    assert_eq!(third.mutations(), 0, "{third:?}");
    assert_eq!(t.journal.trades().len(), 1);
}

#[tokio::test]
async fn restart_restores_ladder_progress_from_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("positions.json");
    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_mark_price("BTCUSDT", dec!(100));

    let start = |exchange: &Arc<SimulatedExchange>| {
        Engine::new(
            fast_config(),
            exchange.clone(),
            Arc::new(InMemoryTradeJournal::new()),
            Arc::new(SnapshotStore::open(&path).unwrap()),
        )
        .unwrap()
    };

    {
        let before = start(&exchange);
        assert!(before.submit(long("BTCUSDT")).await.unwrap().is_opened());
        exchange.set_mark_price("BTCUSDT", dec!(103));
        let tick = before.monitor().run_once(Utc::now()).await;
        assert_eq!(tick.take_profits, vec![("BTCUSDT".to_string(), 0)]);
    }

    let after = start(&exchange);
    let startup = after.startup().await;
    assert_eq!(startup.reconciliation.adopted, vec!["BTCUSDT".to_string()]);

    let position = after.controller().registry().get("BTCUSDT").unwrap();
    assert_eq!(position.levels_hit(), 1);
    assert_eq!(position.original_qty, dec!(1.36));
    assert_eq!(position.remaining_qty(), dec!(1.02));
    assert!(position.stop_price() >= dec!(100.1));
    assert!(position.breakeven_applied);
    assert_eq!(position.protection.state(), ProtectionState::Protected);

    // the previous run's orders were replaced, not duplicated
    let stops = exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].trigger_price, Some(position.stop_price()));
    assert!(exchange.open_orders_of("BTCUSDT", OrderKind::TakeProfitMarket).len() <= 1);

    assert_eq!(after.reconciler().run_once().await.mutations(), 0);
}

#[tokio::test]
async fn disabled_reconciliation_leaves_drift_alone() {
    let mut config = fast_config();
    config.reconciliation.enabled = false;
    let t = common::engine_with(config);
    t.exchange.inject_position(exchange_long("SOLUSDT", dec!(2), dec!(50)));

    let report = t.engine.reconciler().run_once().await;
    assert_eq!(report.mutations(), 0);
    assert!(t.engine.controller().registry().is_empty());
}
